pub mod health;
pub mod jobs;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Build the HTTP API over `state`.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/v1/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/api/v1/jobs/{job_id}/output", get(jobs::download_output))
        .route("/api/v1/jobs/{job_id}/source", get(jobs::download_source))
        .route(
            "/api/v1/uploads",
            post(jobs::upload_video).layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
