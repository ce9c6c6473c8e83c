//! HTTP surface exercised in-process through the router.

mod fixtures;
mod helpers;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use caption_pipeline::app_state::AppState;
use caption_pipeline::models::api::{
    CancelResponse, ErrorResponse, JobListResponse, JobStatusResponse, SubmitResponse,
};
use caption_pipeline::models::job::{CancelOutcome, ErrorKind, JobState};
use caption_pipeline::routes::{self, health::HealthResponse};
use helpers::Harness;

const BOUNDARY: &str = "caption-test-boundary";

fn app(harness: &Harness) -> Router {
    let state = AppState::new(harness.orchestrator.clone(), 1024 * 1024);
    let handle = PrometheusBuilder::new().build_recorder().handle();
    routes::router(state, Arc::new(handle))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn multipart_request(filename: &str, video: &[u8], style: Option<&str>) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"{filename}\"\r\nContent-Type: video/mp4\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(video);
    body.extend_from_slice(b"\r\n");
    if let Some(style) = style {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"style\"\r\n\r\n{style}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/uploads")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn submit_url(app: &Router, url: &str) -> SubmitResponse {
    let (status, body) = send(
        app,
        json_request(
            Method::POST,
            "/api/v1/jobs",
            json!({ "source": { "type": "remote_url", "url": url } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn submit_then_poll_status() {
    let harness = Harness::new();
    let app = app(&harness);

    let submitted = submit_url(&app, "https://cdn.example.com/talk.mp4").await;
    assert_eq!(submitted.state, JobState::Pending);
    assert_eq!(submitted.progress, 10);

    let (status, body) = send(
        &app,
        empty_request(Method::GET, &format!("/api/v1/jobs/{}", submitted.job_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job: JobStatusResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(job.job_id, submitted.job_id);
    assert_eq!(job.state, JobState::Pending);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn invalid_submissions_get_an_error_body() {
    let harness = Harness::new();
    let app = app(&harness);

    let cases = [
        json!({ "source": { "type": "remote_url", "url": "ftp://host/a.mp4" } }),
        json!({
            "source": { "type": "remote_url", "url": "https://host/a.mp4" },
            "style": { "font_size": 500 }
        }),
        json!({ "source": { "type": "carrier_pigeon" } }),
    ];
    for case in cases {
        let (status, body) = send(&app, json_request(Method::POST, "/api/v1/jobs", case)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "InvalidInput");
        assert!(!error.message.is_empty());
    }
    assert!(harness.orchestrator.list(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let harness = Harness::new();
    let app = app(&harness);
    let id = uuid::Uuid::new_v4();

    for request in [
        empty_request(Method::GET, &format!("/api/v1/jobs/{}", id)),
        empty_request(Method::POST, &format!("/api/v1/jobs/{}/cancel", id)),
        empty_request(Method::DELETE, &format!("/api/v1/jobs/{}", id)),
    ] {
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "NotFound");
    }
}

#[tokio::test]
async fn list_pages_newest_first() {
    let harness = Harness::new();
    let app = app(&harness);

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(submit_url(&app, &format!("https://cdn.example.com/{}.mp4", i)).await.job_id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let (status, body) = send(&app, empty_request(Method::GET, "/api/v1/jobs?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    let page: JobListResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(page.limit, 2);
    assert_eq!(page.offset, 0);
    let listed: Vec<_> = page.jobs.iter().map(|j| j.job_id).collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);

    let (_, body) = send(&app, empty_request(Method::GET, "/api/v1/jobs?limit=2&offset=2")).await;
    let page: JobListResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job_id, ids[0]);

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/jobs?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_and_delete_a_queued_job() {
    let harness = Harness::new();
    let app = app(&harness);
    let job_id = submit_url(&app, "https://cdn.example.com/x.mp4").await.job_id;

    let (status, body) = send(
        &app,
        empty_request(Method::POST, &format!("/api/v1/jobs/{}/cancel", job_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cancelled: CancelResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(cancelled.outcome, CancelOutcome::Cancelled);

    let (_, body) = send(&app, empty_request(Method::GET, &format!("/api/v1/jobs/{}", job_id))).await;
    let job: JobStatusResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Cancelled);

    let (status, _) = send(&app, empty_request(Method::DELETE, &format!("/api/v1/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, empty_request(Method::GET, &format!("/api/v1/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_stores_the_video_and_queues_a_job() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, body) = send(
        &app,
        multipart_request("my clip.mp4", b"\x00\x00\x00\x18ftypmp42", Some(r#"{"font_size": 32, "position": "top"}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", String::from_utf8_lossy(&body));
    let submitted: SubmitResponse = serde_json::from_slice(&body).unwrap();

    let uploads = harness.storage.keys_with_prefix("uploads/").await;
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].ends_with("/my_clip.mp4"));

    let job = harness.orchestrator.get(submitted.job_id).await.unwrap();
    assert_eq!(job.style.font_size, 32);
    assert!(job.source.uploaded_locator().is_some());
}

#[tokio::test]
async fn upload_rejects_unsupported_files_without_storing_them() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, body) = send(&app, multipart_request("notes.txt", b"hello", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.error, "InvalidInput");

    let (status, _) = send(
        &app,
        multipart_request("clip.mp4", b"data", Some(r#"{"font_color": "red"}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(harness.storage.keys().await.is_empty());
}

#[tokio::test]
async fn output_is_downloadable_once_the_job_completes() {
    let harness = Harness::new();
    let app = app(&harness);
    let (status, body) = send(
        &app,
        multipart_request("talk.mov", b"\x00\x00\x00\x14ftypqt  ", None),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = serde_json::from_slice::<SubmitResponse>(&body).unwrap().job_id;
    let output_uri = format!("/api/v1/jobs/{}/output", job_id);

    let (status, body) = send(&app, empty_request(Method::GET, &output_uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.error, "Conflict");

    let workers = harness.start_workers(1);
    let finished = harness.wait_for_terminal(job_id).await;
    workers.stop().await;
    assert_eq!(finished.state, JobState::Completed);

    let response = app
        .clone()
        .oneshot(empty_request(Method::GET, &output_uri))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"talk_captioned.mp4\""
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.starts_with(b"captioned "));

    let response = app
        .clone()
        .oneshot(empty_request(Method::GET, &format!("/api/v1/jobs/{}/source", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/quicktime");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"\x00\x00\x00\x14ftypqt  ");
}

#[tokio::test]
async fn downloads_of_unknown_failed_or_remote_jobs() {
    let harness = Harness::new();
    let app = app(&harness);

    for uri in ["output", "source"] {
        let (status, _) = send(
            &app,
            empty_request(Method::GET, &format!("/api/v1/jobs/{}/{}", uuid::Uuid::new_v4(), uri)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let job_id = submit_url(&app, "https://cdn.example.com/remote.mp4").await.job_id;
    let response = app
        .clone()
        .oneshot(empty_request(Method::GET, &format!("/api/v1/jobs/{}/source", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://cdn.example.com/remote.mp4"
    );

    harness.orchestrator.cancel(job_id).await.unwrap();
    let (status, _) = send(
        &app,
        empty_request(Method::GET, &format!("/api/v1/jobs/{}/output", job_id)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_reports_components_and_cache() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, body) = send(&app, empty_request(Method::GET, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.checks.job_store.status, "ok");
    assert_eq!(health.checks.work_queue.status, "ok");
    assert_eq!(health.transcript_cache.entries, 0);

    let (status, _) = send(&app, empty_request(Method::GET, "/metrics")).await;
    assert_eq!(status, StatusCode::OK);
}
