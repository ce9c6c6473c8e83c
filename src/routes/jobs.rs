use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    CancelResponse, ErrorResponse, JobListResponse, JobStatusResponse, ListQuery, SubmitRequest,
    SubmitResponse,
};
use crate::models::job::{CaptionJob, JobState, Source};
use crate::models::style::CaptionStyle;
use crate::services::orchestrator::OrchestratorError;
use crate::services::storage::{upload_key, StorageError};

/// Error returned by the job endpoints, rendered as an [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "InvalidInput",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Internal",
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let (status, error) = match &e {
            OrchestratorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "InvalidInput"),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            OrchestratorError::Busy(_) => (StatusCode::CONFLICT, "Busy"),
            OrchestratorError::Conflict(_) | OrchestratorError::LeaseExpired(_) => {
                (StatusCode::CONFLICT, "Conflict")
            }
            OrchestratorError::Store(_) => {
                tracing::error!(error = %e, "Job store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal")
            }
        };
        Self {
            status,
            error,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn accepted(job: &CaptionJob) -> (StatusCode, Json<SubmitResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            state: job.state,
            progress: job.progress,
            message: "Video queued for captioning".to_string(),
        }),
    )
}

/// POST /api/v1/jobs: submit a remote or previously uploaded video.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body?;
    let job = state
        .orchestrator
        .submit(request.source, request.style)
        .await?;
    Ok(accepted(&job))
}

/// POST /api/v1/uploads: store a `video` multipart field and submit it.
///
/// An optional `style` field carries the caption style as JSON.
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut video: Option<(String, Vec<u8>)> = None;
    let mut style = CaptionStyle::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("video") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("video field has no filename"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                video = Some((filename, data.to_vec()));
            }
            Some("style") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                style = serde_json::from_str(&text)
                    .map_err(|e| ApiError::bad_request(format!("invalid style: {}", e)))?;
            }
            _ => {}
        }
    }

    let (filename, data) = video.ok_or_else(|| ApiError::bad_request("missing video field"))?;
    if data.is_empty() {
        return Err(ApiError::bad_request("uploaded video is empty"));
    }

    // Reject bad input before anything is written.
    let style_check = SubmitRequest {
        source: Source::Upload {
            locator: "pending".to_string(),
            filename: filename.clone(),
        },
        style,
    };
    style_check
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    style_check
        .source
        .validate(&state.orchestrator.settings().video_formats)
        .map_err(ApiError::bad_request)?;

    let key = upload_key(Uuid::new_v4(), &filename);
    let locator = state.storage.store(&data, &key).await.map_err(|e| {
        tracing::error!(error = %e, key = %key, "Failed to store upload");
        ApiError::internal("failed to store upload")
    })?;
    tracing::info!(filename = %filename, bytes = data.len(), "Video uploaded");

    let source = Source::Upload {
        locator: locator.clone(),
        filename,
    };
    match state.orchestrator.submit(source, style_check.style).await {
        Ok(job) => Ok(accepted(&job)),
        Err(e) => {
            if let Err(cleanup) = state.storage.delete(&locator).await {
                tracing::warn!(error = %cleanup, locator = %locator, "Failed to remove orphaned upload");
            }
            Err(e.into())
        }
    }
}

/// GET /api/v1/jobs: page through jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<JobListResponse>, ApiError> {
    let Query(query) = query?;
    query
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let jobs = state.orchestrator.list(query.limit, query.offset).await?;
    Ok(Json(JobListResponse {
        jobs: jobs.iter().map(JobStatusResponse::from).collect(),
        limit: query.limit,
        offset: query.offset,
    }))
}

/// GET /api/v1/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.orchestrator.get(job_id).await?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// POST /api/v1/jobs/{job_id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state.orchestrator.cancel(job_id).await?;
    Ok(Json(CancelResponse { job_id, outcome }))
}

/// DELETE /api/v1/jobs/{job_id}: cancel the job and remove its artifacts.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/jobs/{job_id}/output: the captioned video of a completed job.
pub async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.orchestrator.get(job_id).await?;
    let locator = match (job.state, job.artifacts.output.as_deref()) {
        (JobState::Completed, Some(locator)) => locator,
        (job_state, _) => {
            return Err(ApiError {
                status: StatusCode::CONFLICT,
                error: "Conflict",
                message: format!("job {} is {}; output is ready once completed", job_id, job_state),
            })
        }
    };

    let bytes = fetch_artifact(&state, job_id, locator).await?;
    let filename = match &job.source {
        Source::Upload { filename, .. } => {
            let stem = filename.rsplit_once('.').map_or(filename.as_str(), |(stem, _)| stem);
            format!("{}_captioned.mp4", stem)
        }
        Source::RemoteUrl { .. } => format!("{}_captioned.mp4", job_id),
    };
    Ok(attachment(bytes, "mp4", &filename))
}

/// GET /api/v1/jobs/{job_id}/source: the uploaded video, or a redirect to
/// the remote one.
pub async fn download_source(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.orchestrator.get(job_id).await?;
    match &job.source {
        Source::Upload { locator, filename } => {
            let bytes = fetch_artifact(&state, job_id, locator).await?;
            let extension = filename.rsplit_once('.').map_or("", |(_, ext)| ext);
            Ok(attachment(bytes, extension, filename))
        }
        Source::RemoteUrl { url } => Ok(Redirect::temporary(url).into_response()),
    }
}

async fn fetch_artifact(state: &AppState, job_id: Uuid, locator: &str) -> Result<Vec<u8>, ApiError> {
    state.storage.fetch(locator).await.map_err(|e| match e {
        StorageError::NotFound(_) => ApiError {
            status: StatusCode::NOT_FOUND,
            error: "NotFound",
            message: format!("artifact of job {} is no longer stored", job_id),
        },
        e => {
            tracing::error!(job_id = %job_id, locator = %locator, error = %e, "Failed to fetch artifact");
            ApiError::internal("failed to fetch artifact")
        }
    })
}

fn attachment(bytes: Vec<u8>, extension: &str, filename: &str) -> Response {
    let content_type = match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    };
    let safe: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}
