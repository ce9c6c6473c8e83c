use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{CancelOutcome, CaptionJob, JobError, JobState, Source};
use crate::models::style::CaptionStyle;

/// Request to caption a video that is reachable by URL or already uploaded.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(skip)]
    pub source: Source,

    #[garde(dive)]
    #[serde(default)]
    pub style: CaptionStyle,
}

/// Response after a job was accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress: u8,
    pub message: String,
}

/// Response for polling a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CaptionJob> for JobStatusResponse {
    fn from(job: &CaptionJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            progress: job.progress,
            error: job.error.clone(),
            output: job.artifacts.output.clone(),
            updated_at: job.updated_at,
        }
    }
}

/// Paged job listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusResponse>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListQuery {
    #[garde(range(min = 1, max = 200))]
    #[serde(default = "default_limit")]
    pub limit: i64,

    #[garde(range(min = 0))]
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub outcome: CancelOutcome,
}

/// Body returned for every non-2xx API response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
