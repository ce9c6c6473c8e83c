use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::services::cache::CacheStats;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub transcript_cache: CacheStats,
}

#[derive(Serialize, Deserialize)]
pub struct HealthChecks {
    pub job_store: ComponentHealth,
    pub work_queue: ComponentHealth,
    pub storage: ComponentHealth,
}

#[derive(Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(
        component: &str,
        start: std::time::Instant,
        result: Result<(), E>,
    ) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(component, error = %e, "Health check failed");
                Self {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: dependency status plus transcript cache counters.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let job_store = ComponentHealth::from_result(
        "job_store",
        start,
        state.orchestrator.store().health_check().await,
    );

    let start = std::time::Instant::now();
    let work_queue = ComponentHealth::from_result(
        "work_queue",
        start,
        state.orchestrator.queue().health_check().await,
    );

    let start = std::time::Instant::now();
    let storage = ComponentHealth::from_result("storage", start, state.storage.health_check().await);

    let all_healthy = job_store.is_ok() && work_queue.is_ok() && storage.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            job_store,
            work_queue,
            storage,
        },
        transcript_cache: state.cache.stats(),
    };

    (status_code, Json(response))
}
