//! Stage executors.
//!
//! Each executor reads the artifacts committed by earlier stages, calls one
//! collaborator and writes its own output under a key derived from the job id
//! and stage name, so running a stage twice overwrites instead of piling up.

use std::sync::Arc;

use crate::models::job::{CaptionJob, ErrorKind, JobError, Stage, StageOutput};
use crate::models::media::MediaMetadata;
use crate::models::overlay::OverlayTrack;
use crate::models::transcript::{Segment, Transcript, Word};
use crate::services::audio;
use crate::services::cache::{CacheLookup, TranscriptCache};
use crate::services::media::{CompositeRequest, Compositor, MediaExtractor};
use crate::services::renderer::CaptionRenderer;
use crate::services::storage::{stage_key, Storage, StorageError};
use crate::services::transcription::Transcriber;
use crate::services::workspace::JobScratch;

/// Collaborators and shared components the stages run against.
pub struct Pipeline {
    pub extractor: Arc<dyn MediaExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub compositor: Arc<dyn Compositor>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<TranscriptCache>,
    pub renderer: CaptionRenderer,
}

fn storage_failure(e: StorageError) -> JobError {
    JobError::new(ErrorKind::TransientStageFailure, e.to_string())
}

fn missing(what: &str) -> JobError {
    JobError::new(
        ErrorKind::IoFailure,
        format!("{} from an earlier stage is missing", what),
    )
}

fn metadata(job: &CaptionJob) -> Result<&MediaMetadata, JobError> {
    job.artifacts
        .metadata
        .as_ref()
        .ok_or_else(|| missing("media metadata"))
}

impl Pipeline {
    /// Execute `stage` once for `job`.
    pub async fn run(
        &self,
        job: &CaptionJob,
        stage: Stage,
        scratch: &JobScratch,
    ) -> Result<StageOutput, JobError> {
        match stage {
            Stage::ExtractingAudio => self.extract(job, scratch).await,
            Stage::Transcribing => self.transcribe(job).await,
            Stage::Rendering => self.render(job).await,
            Stage::Compositing => self.composite(job, scratch).await,
        }
    }

    async fn extract(&self, job: &CaptionJob, scratch: &JobScratch) -> Result<StageOutput, JobError> {
        let (pcm, metadata) = self
            .extractor
            .extract(&job.source, scratch)
            .await
            .map_err(|e| JobError::new(e.kind(), e.to_string()))?;
        if metadata.duration_ms == 0 || metadata.width == 0 || metadata.height == 0 {
            return Err(JobError::new(
                ErrorKind::Unsupported,
                "video reports no duration or frame size",
            ));
        }

        let normalized = audio::normalize(&pcm);
        let fingerprint = audio::fingerprint(&normalized);
        let wav = audio::encode_wav(&normalized)
            .map_err(|e| JobError::new(ErrorKind::IoFailure, e.to_string()))?;
        let key = stage_key(job.id, Stage::ExtractingAudio.as_ref(), "audio.wav");
        let locator = self
            .storage
            .store(&wav, &key)
            .await
            .map_err(storage_failure)?;

        tracing::info!(
            job_id = %job.id,
            fingerprint = %fingerprint,
            audio_ms = normalized.duration_ms(),
            "Audio extracted"
        );

        Ok(StageOutput::AudioExtracted {
            audio: locator,
            fingerprint,
            metadata,
        })
    }

    async fn transcribe(&self, job: &CaptionJob) -> Result<StageOutput, JobError> {
        let audio_locator = job.artifacts.audio.as_deref().ok_or_else(|| missing("audio"))?;
        let fingerprint = job
            .artifacts
            .fingerprint
            .as_deref()
            .ok_or_else(|| missing("audio fingerprint"))?;

        let wav = self
            .storage
            .fetch(audio_locator)
            .await
            .map_err(storage_failure)?;
        let pcm = audio::decode_wav(&wav)
            .map_err(|e| JobError::new(ErrorKind::IoFailure, e.to_string()))?;

        let (transcript, lookup) = self
            .cache
            .get_or_compute(fingerprint, pcm.duration_ms(), || {
                self.transcriber.transcribe(&pcm)
            })
            .await
            .map_err(|e| JobError::new(e.kind(), e.to_string()))?;

        let body = serde_json::to_vec(transcript.as_ref())
            .map_err(|e| JobError::new(ErrorKind::TransientStageFailure, e.to_string()))?;
        let key = stage_key(job.id, Stage::Transcribing.as_ref(), "transcript.json");
        let locator = self
            .storage
            .store(&body, &key)
            .await
            .map_err(storage_failure)?;

        tracing::info!(
            job_id = %job.id,
            segments = transcript.segments.len(),
            lookup = ?lookup,
            "Transcript ready"
        );

        Ok(StageOutput::Transcribed {
            transcript: locator,
            segment_count: transcript.segments.len(),
            cache_hit: lookup != CacheLookup::Computed,
        })
    }

    async fn render(&self, job: &CaptionJob) -> Result<StageOutput, JobError> {
        let locator = job
            .artifacts
            .transcript
            .as_deref()
            .ok_or_else(|| missing("transcript"))?;
        let metadata = metadata(job)?;

        let bytes = self.storage.fetch(locator).await.map_err(storage_failure)?;
        let transcript: Transcript = serde_json::from_slice(&bytes)
            .map_err(|e| JobError::new(ErrorKind::IoFailure, e.to_string()))?;

        let segments = clip_to_duration(&transcript.segments, metadata.duration_ms);
        let track = self
            .renderer
            .render(&segments, &job.style, metadata.width, metadata.height);

        let body = track
            .to_bytes()
            .map_err(|e| JobError::new(ErrorKind::TransientStageFailure, e.to_string()))?;
        let key = stage_key(job.id, Stage::Rendering.as_ref(), "overlays.json");
        let locator = self
            .storage
            .store(&body, &key)
            .await
            .map_err(storage_failure)?;

        Ok(StageOutput::Rendered {
            overlays: locator,
            overlay_count: track.overlays.len(),
        })
    }

    async fn composite(&self, job: &CaptionJob, scratch: &JobScratch) -> Result<StageOutput, JobError> {
        let locator = job
            .artifacts
            .overlays
            .as_deref()
            .ok_or_else(|| missing("overlay track"))?;
        let metadata = metadata(job)?;

        let bytes = self.storage.fetch(locator).await.map_err(storage_failure)?;
        let track = OverlayTrack::from_bytes(&bytes)
            .map_err(|e| JobError::new(ErrorKind::IoFailure, e.to_string()))?;
        track
            .validate_timing(metadata.duration_ms)
            .map_err(|e| JobError::new(ErrorKind::InvalidOverlayTiming, e.to_string()))?;

        let output = self
            .compositor
            .composite(CompositeRequest {
                job_id: job.id,
                source: &job.source,
                overlays: &track,
                output_key: stage_key(job.id, Stage::Compositing.as_ref(), "output.mp4"),
                scratch,
            })
            .await
            .map_err(|e| JobError::new(e.kind(), e.to_string()))?;

        Ok(StageOutput::Composited { output })
    }
}

/// Drop speech past the end of the video and trim the segment that crosses
/// it, word timings included.
fn clip_to_duration(segments: &[Segment], duration_ms: u64) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| s.start_ms < duration_ms)
        .map(|s| {
            let mut s = s.clone();
            s.end_ms = s.end_ms.min(duration_ms);
            if let Some(words) = s.words.take() {
                let end = s.end_ms;
                let words: Vec<Word> = words
                    .into_iter()
                    .filter(|w| w.start_ms < end)
                    .map(|w| Word {
                        end_ms: w.end_ms.min(end),
                        ..w
                    })
                    .collect();
                s.words = (!words.is_empty()).then_some(words);
            }
            s
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipping_keeps_segments_inside_video() {
        let segments = vec![
            Segment::new(0, 2_000, "a"),
            Segment::new(9_500, 10_400, "b"),
            Segment::new(10_000, 11_000, "c"),
        ];
        let clipped = clip_to_duration(&segments, 10_000);
        assert_eq!(clipped.len(), 2);
        assert_eq!(clipped[1].end_ms, 10_000);
    }

    #[test]
    fn clipping_trims_word_timings_of_the_crossing_segment() {
        let word = |text: &str, start_ms, end_ms| Word {
            text: text.to_string(),
            start_ms,
            end_ms,
        };
        let segments = vec![Segment::new(9_000, 10_600, "thanks for watching").with_words(vec![
            word("thanks", 9_000, 9_600),
            word("for", 9_600, 10_200),
            word("watching", 10_200, 10_600),
        ])];

        let clipped = clip_to_duration(&segments, 10_000);
        let words = clipped[0].words.as_ref().unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].text, "for");
        assert_eq!(words[1].end_ms, 10_000);
        assert!(words.iter().all(|w| w.end_ms <= clipped[0].end_ms));

        let renderer = CaptionRenderer::new(crate::services::renderer::RenderConfig {
            highlight_words: true,
            ..Default::default()
        });
        let track = renderer.render(
            &clipped,
            &crate::models::style::CaptionStyle::default(),
            1280,
            720,
        );
        track.validate_timing(10_000).unwrap();
        assert!(track
            .overlays
            .iter()
            .flat_map(|o| o.lines.iter())
            .all(|line| !line.text.contains("watching")));
        assert!(track.overlays.iter().any(|o| o.highlight.is_some()));
    }

    #[test]
    fn words_past_the_end_are_dropped_with_their_segment_text_kept() {
        let segments = vec![Segment::new(9_800, 10_500, "late").with_words(vec![Word {
            text: "late".to_string(),
            start_ms: 10_100,
            end_ms: 10_500,
        }])];
        let clipped = clip_to_duration(&segments, 10_000);
        assert_eq!(clipped[0].end_ms, 10_000);
        assert!(clipped[0].words.is_none());
        assert_eq!(clipped[0].text, "late");
    }
}
