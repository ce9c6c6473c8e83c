//! Media collaborators: audio extraction and caption compositing.
//!
//! `FfmpegMedia` shells out to the `ffprobe` and `ffmpeg` binaries. Each
//! invocation works inside the job's stage scratch directory, so a retried
//! stage starts from a clean slate.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use uuid::Uuid;

use crate::models::job::{ErrorKind, Source};
use crate::models::media::{MediaMetadata, PcmAudio};
use crate::models::overlay::{Overlay, OverlayTrack};
use crate::services::audio::NORMALIZED_SAMPLE_RATE;
use crate::services::storage::{Storage, StorageError};
use crate::services::workspace::JobScratch;

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Decode the audio track of `source` and report container metadata.
    async fn extract(
        &self,
        source: &Source,
        scratch: &JobScratch,
    ) -> Result<(PcmAudio, MediaMetadata), ExtractError>;
}

/// Everything the compositor needs to burn captions into one video.
pub struct CompositeRequest<'a> {
    pub job_id: Uuid,
    pub source: &'a Source,
    pub overlays: &'a OverlayTrack,
    /// Storage key the muxed output is written under.
    pub output_key: String,
    pub scratch: &'a JobScratch,
}

#[async_trait]
pub trait Compositor: Send + Sync {
    /// Returns the storage locator of the captioned video.
    async fn composite(&self, request: CompositeRequest<'_>) -> Result<String, CompositeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("Unsupported media: {0}")]
    Unsupported(String),

    #[error("Media I/O failed: {0}")]
    IoFailure(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Unsupported(_) => ErrorKind::Unsupported,
            ExtractError::IoFailure(_) => ErrorKind::IoFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Compositing I/O failed: {0}")]
    IoFailure(String),
}

impl CompositeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompositeError::UnsupportedCodec(_) => ErrorKind::UnsupportedCodec,
            CompositeError::IoFailure(_) => ErrorKind::IoFailure,
        }
    }
}

impl From<StorageError> for ExtractError {
    fn from(e: StorageError) -> Self {
        ExtractError::IoFailure(e.to_string())
    }
}

impl From<StorageError> for CompositeError {
    fn from(e: StorageError) -> Self {
        CompositeError::IoFailure(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeJson {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

fn parse_rate(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "0/0" || s == "0" {
        return None;
    }
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => s.parse().ok(),
    }
}

/// Container metadata from `ffprobe -print_format json` output.
fn parse_probe(stdout: &[u8]) -> Result<MediaMetadata, ExtractError> {
    let parsed: FfprobeJson = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::Unsupported(format!("unreadable probe output: {}", e)))?;
    let streams = parsed.streams.unwrap_or_default();

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ExtractError::Unsupported("no video stream".to_string()))?;
    if !streams.iter().any(|s| s.codec_type.as_deref() == Some("audio")) {
        return Err(ExtractError::Unsupported("no audio stream".to_string()));
    }

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(ExtractError::Unsupported("video has no frame size".to_string())),
    };
    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);

    let format = parsed.format.as_ref();
    let duration_ms = format
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .map(crate::models::transcript::secs_to_ms)
        .ok_or_else(|| ExtractError::Unsupported("unknown duration".to_string()))?;
    let format = format
        .and_then(|f| f.format_name.as_deref())
        .and_then(|n| n.split(',').next())
        .unwrap_or("unknown")
        .to_string();

    Ok(MediaMetadata {
        duration_ms,
        width,
        height,
        fps,
        format,
    })
}

fn pcm_from_s16le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Extension of the source's file name, used for the scratch copy.
fn source_extension(source: &Source) -> String {
    let name = match source {
        Source::Upload { filename, .. } => filename.as_str(),
        Source::RemoteUrl { url } => url.split(['?', '#']).next().unwrap_or(url),
    };
    name.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && !ext.contains('/'))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

/// Quote a value for use inside a single-quoted filtergraph option.
fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '\'' | ':' | ',' | ';' | '[' | ']' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn ffmpeg_color(hex: &str) -> String {
    format!("0x{}", hex.trim_start_matches('#'))
}

fn secs(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

/// Map an ffmpeg failure onto the collaborator's error contract.
fn classify_ffmpeg_failure(stderr: &str) -> CompositeError {
    let lower = stderr.to_ascii_lowercase();
    let codec_markers = [
        "unknown encoder",
        "unknown decoder",
        "decoder not found",
        "encoder not found",
        "codec not currently supported",
        "could not find codec parameters",
        "invalid data found when processing input",
    ];
    let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
    if codec_markers.iter().any(|m| lower.contains(m)) {
        CompositeError::UnsupportedCodec(tail)
    } else {
        CompositeError::IoFailure(tail)
    }
}

/// ffprobe/ffmpeg backed implementation of both media collaborators.
pub struct FfmpegMedia {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    font_dir: PathBuf,
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
}

impl FfmpegMedia {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
        font_dir: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            font_dir: font_dir.into(),
            storage,
            http: reqwest::Client::new(),
        }
    }

    /// Copy the source video into the scratch directory.
    async fn materialize(&self, source: &Source, scratch: &JobScratch) -> Result<PathBuf, String> {
        let bytes = match source {
            Source::Upload { locator, .. } => self
                .storage
                .fetch(locator)
                .await
                .map_err(|e| e.to_string())?,
            Source::RemoteUrl { url } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| format!("download of {} failed: {}", url, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(format!("download of {} returned {}", url, status));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| format!("download of {} failed: {}", url, e))?
                    .to_vec()
            }
        };
        let path = scratch.path(&format!("source.{}", source_extension(source)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("writing {}: {}", path.display(), e))?;
        Ok(path)
    }

    async fn probe(&self, path: &Path) -> Result<MediaMetadata, ExtractError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_format", "-show_streams", "-print_format", "json"])
            .arg(path)
            .output()
            .await
            .map_err(|e| ExtractError::IoFailure(format!("failed to run ffprobe: {}", e)))?;
        if !output.status.success() {
            return Err(ExtractError::Unsupported(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_probe(&output.stdout)
    }

    fn font_path(&self, overlay: &Overlay) -> Result<PathBuf, CompositeError> {
        let path = self.font_dir.join(overlay.font_family.file_name());
        if path.is_file() {
            Ok(path)
        } else {
            Err(CompositeError::IoFailure(format!(
                "font file for {} not found at {}",
                overlay.font_family,
                path.display()
            )))
        }
    }

    /// Write one `drawtext` filter per overlay line (plus the highlighted
    /// word) into a filter script. Line texts go to their own files so they
    /// never need filtergraph escaping.
    async fn write_filter_script(
        &self,
        track: &OverlayTrack,
        scratch: &JobScratch,
    ) -> Result<PathBuf, CompositeError> {
        let io = |e: std::io::Error| CompositeError::IoFailure(e.to_string());
        let mut filters = Vec::new();

        for (i, overlay) in track.overlays.iter().enumerate() {
            let font = escape_filter_value(&self.font_path(overlay)?.to_string_lossy());
            let enable = format!(
                "gte(t,{})*lt(t,{})",
                secs(overlay.start_ms),
                secs(overlay.end_ms)
            );
            let mut draw = |text: &str, name: String, x: i32, y: i32, fill: &str| {
                let path = scratch.path(&name);
                let filter = format!(
                    "drawtext=fontfile='{}':textfile='{}':x={}:y={}:fontsize={}:fontcolor={}:borderw={}:bordercolor={}:enable='{}'",
                    font,
                    escape_filter_value(&path.to_string_lossy()),
                    x,
                    y,
                    overlay.font_size,
                    ffmpeg_color(fill),
                    overlay.stroke_width,
                    ffmpeg_color(&overlay.stroke),
                    enable
                );
                filters.push(filter);
                (path, text.to_string())
            };

            let mut texts = Vec::new();
            for (l, line) in overlay.lines.iter().enumerate() {
                texts.push(draw(&line.text, format!("text_{}_{}.txt", i, l), line.x, line.y, &overlay.fill));
            }
            if let Some(h) = &overlay.highlight {
                let y = overlay.lines.get(h.line).map(|l| l.y).unwrap_or(overlay.y);
                texts.push(draw(&h.text, format!("text_{}_hl.txt", i), h.x, y, &h.fill));
            }
            for (path, text) in texts {
                tokio::fs::write(&path, text).await.map_err(io)?;
            }
        }

        if filters.is_empty() {
            filters.push("null".to_string());
        }
        let script = scratch.path("overlays.filter");
        tokio::fs::write(&script, filters.join(",\n"))
            .await
            .map_err(io)?;
        Ok(script)
    }
}

#[async_trait]
impl MediaExtractor for FfmpegMedia {
    async fn extract(
        &self,
        source: &Source,
        scratch: &JobScratch,
    ) -> Result<(PcmAudio, MediaMetadata), ExtractError> {
        let input = self
            .materialize(source, scratch)
            .await
            .map_err(ExtractError::IoFailure)?;
        let metadata = self.probe(&input).await?;

        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(&input)
            .args(["-vn", "-ac", "1", "-ar"])
            .arg(NORMALIZED_SAMPLE_RATE.to_string())
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-"])
            .output()
            .await
            .map_err(|e| ExtractError::IoFailure(format!("failed to run ffmpeg: {}", e)))?;
        if !output.status.success() {
            return Err(ExtractError::Unsupported(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let audio = PcmAudio::new(pcm_from_s16le(&output.stdout), NORMALIZED_SAMPLE_RATE, 1);
        tracing::debug!(
            duration_ms = metadata.duration_ms,
            audio_ms = audio.duration_ms(),
            width = metadata.width,
            height = metadata.height,
            "Extracted audio"
        );
        Ok((audio, metadata))
    }
}

#[async_trait]
impl Compositor for FfmpegMedia {
    async fn composite(&self, request: CompositeRequest<'_>) -> Result<String, CompositeError> {
        let input = self
            .materialize(request.source, request.scratch)
            .await
            .map_err(CompositeError::IoFailure)?;
        let script = self
            .write_filter_script(request.overlays, request.scratch)
            .await?;
        let output_path = request.scratch.path("captioned.mp4");

        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-y", "-i"])
            .arg(&input)
            .arg("-filter_script:v")
            .arg(&script)
            .args(["-c:v", "libx264", "-preset", "fast", "-c:a", "copy", "-movflags", "+faststart"])
            .arg(&output_path)
            .output()
            .await
            .map_err(|e| CompositeError::IoFailure(format!("failed to run ffmpeg: {}", e)))?;
        if !output.status.success() {
            return Err(classify_ffmpeg_failure(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        let bytes = tokio::fs::read(&output_path)
            .await
            .map_err(|e| CompositeError::IoFailure(e.to_string()))?;
        let locator = self.storage.store(&bytes, &request.output_key).await?;
        tracing::info!(
            job_id = %request.job_id,
            overlays = request.overlays.overlays.len(),
            bytes = bytes.len(),
            "Composited captions"
        );
        Ok(locator)
    }
}
