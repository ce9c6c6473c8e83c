use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::media::MediaMetadata;
use crate::models::style::CaptionStyle;

/// Progress granted when a job is accepted, before any stage runs.
pub const ACCEPTANCE_WEIGHT: u8 = 10;

/// Pipeline state of a captioning job.
///
/// Non-terminal states name the stage currently in progress. The state only
/// moves forward, except for the jump to `Failed`, which any non-terminal
/// state may take.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    ExtractingAudio,
    Transcribing,
    Rendering,
    Compositing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// The stage executed while the job sits in this state.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobState::ExtractingAudio => Some(Stage::ExtractingAudio),
            JobState::Transcribing => Some(Stage::Transcribing),
            JobState::Rendering => Some(Stage::Rendering),
            JobState::Compositing => Some(Stage::Compositing),
            _ => None,
        }
    }

    /// Forward successor on success. `Failed` is never a successor.
    pub fn next(self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::ExtractingAudio),
            JobState::ExtractingAudio => Some(JobState::Transcribing),
            JobState::Transcribing => Some(JobState::Rendering),
            JobState::Rendering => Some(JobState::Compositing),
            JobState::Compositing => Some(JobState::Completed),
            JobState::Completed | JobState::Failed => None,
        }
    }

    /// Progress percentage derived from the stage-weight table.
    ///
    /// Returns `None` for `Failed`: a failed job keeps the progress of the
    /// state it failed from.
    pub fn progress(self) -> Option<u8> {
        let finished: &[Stage] = match self {
            JobState::Pending | JobState::ExtractingAudio => &[],
            JobState::Transcribing => &[Stage::ExtractingAudio],
            JobState::Rendering => &[Stage::ExtractingAudio, Stage::Transcribing],
            JobState::Compositing => &[
                Stage::ExtractingAudio,
                Stage::Transcribing,
                Stage::Rendering,
            ],
            JobState::Completed => &Stage::ALL,
            JobState::Failed => return None,
        };
        Some(ACCEPTANCE_WEIGHT + finished.iter().map(|s| s.weight()).sum::<u8>())
    }
}

/// One pipeline phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    ExtractingAudio,
    Transcribing,
    Rendering,
    Compositing,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::ExtractingAudio,
        Stage::Transcribing,
        Stage::Rendering,
        Stage::Compositing,
    ];

    pub fn weight(self) -> u8 {
        match self {
            Stage::ExtractingAudio => 10,
            Stage::Transcribing => 40,
            Stage::Rendering => 20,
            Stage::Compositing => 20,
        }
    }
}

/// Stable error classification surfaced on failed jobs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum ErrorKind {
    InvalidInput,
    TransientStageFailure,
    LeaseExpired,
    Cancelled,
    Unsupported,
    UnsupportedCodec,
    #[serde(rename = "IOFailure")]
    #[strum(serialize = "IOFailure")]
    IoFailure,
    ModelFailure,
    InvalidOverlayTiming,
}

impl ErrorKind {
    /// Whether a stage failing with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientStageFailure | ErrorKind::IoFailure | ErrorKind::ModelFailure
        )
    }
}

/// Terminal error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub attempts: u32,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage: None,
            attempts: 0,
        }
    }

    pub fn cancelled(stage: Option<Stage>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "job cancelled".to_string(),
            stage,
            attempts: 0,
        }
    }

    pub fn in_stage(mut self, stage: Stage, attempts: u32) -> Self {
        self.stage = Some(stage);
        self.attempts = attempts;
        self
    }
}

/// Where the video to caption comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    /// A file already placed in storage by the upload endpoint.
    Upload { locator: String, filename: String },
    /// A public http(s) URL fetched by the media collaborator.
    RemoteUrl { url: String },
}

impl Source {
    /// Check the source against the accepted container formats.
    pub fn validate(&self, video_formats: &[String]) -> Result<(), String> {
        match self {
            Source::Upload { locator, filename } => {
                if locator.trim().is_empty() {
                    return Err("upload locator is empty".to_string());
                }
                let extension = filename
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .ok_or_else(|| format!("filename '{}' has no extension", filename))?;
                if !video_formats.iter().any(|f| f.eq_ignore_ascii_case(&extension)) {
                    return Err(format!(
                        "unsupported video format '{}', expected one of: {}",
                        extension,
                        video_formats.join(", ")
                    ));
                }
                Ok(())
            }
            Source::RemoteUrl { url } => {
                let parsed =
                    reqwest::Url::parse(url).map_err(|e| format!("invalid url '{}': {}", url, e))?;
                match parsed.scheme() {
                    "http" | "https" if parsed.host_str().is_some() => Ok(()),
                    scheme => Err(format!("unsupported url scheme '{}'", scheme)),
                }
            }
        }
    }

    /// Storage locator owned by this job, if the source was uploaded.
    pub fn uploaded_locator(&self) -> Option<&str> {
        match self {
            Source::Upload { locator, .. } => Some(locator),
            Source::RemoteUrl { .. } => None,
        }
    }
}

/// Time-bounded ownership grant for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: Uuid,
    pub owner: String,
    /// Fresh per claim; renewals keep it. Commits must present the current one.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Persisted outputs of completed stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlays: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl JobArtifacts {
    /// Locators of stage intermediates, excluding the final output.
    pub fn intermediate_locators(&self) -> Vec<String> {
        [&self.audio, &self.transcript, &self.overlays]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Result of executing the stage named by the job's current state.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    AudioExtracted {
        audio: String,
        fingerprint: String,
        metadata: MediaMetadata,
    },
    Transcribed {
        transcript: String,
        segment_count: usize,
        cache_hit: bool,
    },
    Rendered {
        overlays: String,
        overlay_count: usize,
    },
    Composited {
        output: String,
    },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::AudioExtracted { .. } => Stage::ExtractingAudio,
            StageOutput::Transcribed { .. } => Stage::Transcribing,
            StageOutput::Rendered { .. } => Stage::Rendering,
            StageOutput::Composited { .. } => Stage::Compositing,
        }
    }

    /// Storage locator of the artifact this stage wrote.
    pub fn locator(&self) -> &str {
        match self {
            StageOutput::AudioExtracted { audio, .. } => audio,
            StageOutput::Transcribed { transcript, .. } => transcript,
            StageOutput::Rendered { overlays, .. } => overlays,
            StageOutput::Composited { output } => output,
        }
    }
}

/// What a worker commits through `advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageOutput),
    Failed(JobError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("lease on job {0} expired or was reclaimed")]
    LeaseExpired(Uuid),

    #[error("job is in state {state}, cannot commit output of stage {stage}")]
    StageMismatch { state: JobState, stage: Stage },

    #[error("job already reached terminal state {0}")]
    Terminal(JobState),
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// No worker held the job; it failed with `Cancelled` immediately.
    Cancelled,
    /// A worker holds the job and will honor the flag at the next boundary.
    Requested,
    /// The job had already finished.
    AlreadyFinished,
}

/// Polling view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// One submitted video and its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionJob {
    pub id: Uuid,
    pub source: Source,
    pub style: CaptionStyle,
    pub state: JobState,
    pub progress: u8,
    pub error: Option<JobError>,
    pub lease: Option<Lease>,
    pub cancel_requested: bool,
    pub artifacts: JobArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaptionJob {
    pub fn new(source: Source, style: CaptionStyle, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            style,
            state: JobState::Pending,
            progress: ACCEPTANCE_WEIGHT,
            error: None,
            lease: None,
            cancel_requested: false,
            artifacts: JobArtifacts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            progress: self.progress,
            error: self.error.clone(),
        }
    }

    fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_live(now))
    }

    /// Queued, or abandoned by a worker whose lease lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && !self.has_live_lease(now)
    }

    /// Grant a fresh lease to `owner`. Claiming a pending job starts extraction.
    pub fn claim(&mut self, owner: &str, ttl: chrono::Duration, now: DateTime<Utc>) -> Lease {
        if self.state == JobState::Pending {
            self.set_state(JobState::ExtractingAudio);
        }
        let lease = Lease {
            job_id: self.id,
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        self.lease = Some(lease.clone());
        self.updated_at = now;
        lease
    }

    /// The presented lease must be the current one and unexpired.
    pub fn check_lease(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match &self.lease {
            Some(current)
                if current.token == lease.token
                    && current.owner == lease.owner
                    && current.is_live(now) =>
            {
                Ok(())
            }
            _ => Err(TransitionError::LeaseExpired(self.id)),
        }
    }

    pub fn renew(
        &mut self,
        lease: &Lease,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, TransitionError> {
        self.check_lease(lease, now)?;
        let renewed = Lease {
            expires_at: now + ttl,
            ..lease.clone()
        };
        self.lease = Some(renewed.clone());
        self.updated_at = now;
        Ok(renewed)
    }

    /// Give the job back to the queue without changing its state.
    pub fn release(&mut self, lease: &Lease, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.check_lease(lease, now)?;
        self.lease = None;
        self.updated_at = now;
        Ok(())
    }

    /// Commit a stage result under `lease`.
    pub fn advance(
        &mut self,
        lease: &Lease,
        outcome: StageOutcome,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check_lease(lease, now)?;
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }

        match outcome {
            StageOutcome::Failed(error) => {
                self.fail(error);
            }
            StageOutcome::Completed(output) => {
                let stage = output.stage();
                if self.state.stage() != Some(stage) {
                    return Err(TransitionError::StageMismatch {
                        state: self.state,
                        stage,
                    });
                }
                self.record(output);
                let next = self.state.next().unwrap_or(JobState::Completed);
                self.set_state(next);
                self.lease = if next.is_terminal() {
                    None
                } else {
                    Some(Lease {
                        expires_at: now + ttl,
                        ..lease.clone()
                    })
                };
            }
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        if self.state.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        if self.has_live_lease(now) {
            self.cancel_requested = true;
            self.updated_at = now;
            return CancelOutcome::Requested;
        }
        self.cancel_requested = true;
        self.fail(JobError::cancelled(self.state.stage()));
        self.updated_at = now;
        CancelOutcome::Cancelled
    }

    fn fail(&mut self, error: JobError) {
        self.state = JobState::Failed;
        self.error = Some(error);
        self.lease = None;
    }

    fn set_state(&mut self, state: JobState) {
        self.state = state;
        if let Some(progress) = state.progress() {
            self.progress = self.progress.max(progress);
        }
    }

    fn record(&mut self, output: StageOutput) {
        let artifacts = &mut self.artifacts;
        match output {
            StageOutput::AudioExtracted {
                audio,
                fingerprint,
                metadata,
            } => {
                artifacts.audio = Some(audio);
                artifacts.fingerprint = Some(fingerprint);
                artifacts.metadata = Some(metadata);
            }
            StageOutput::Transcribed {
                transcript,
                segment_count,
                cache_hit,
            } => {
                artifacts.transcript = Some(transcript);
                artifacts.segment_count = Some(segment_count);
                artifacts.cache_hit = Some(cache_hit);
            }
            StageOutput::Rendered {
                overlays,
                overlay_count,
            } => {
                artifacts.overlays = Some(overlays);
                artifacts.overlay_count = Some(overlay_count);
            }
            StageOutput::Composited { output } => {
                artifacts.output = Some(output);
            }
        }
    }
}
