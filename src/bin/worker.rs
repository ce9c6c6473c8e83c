use caption_pipeline::{app_state::AppState, config::AppConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting caption worker pool");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if config.database_url.is_none() {
        tracing::warn!(
            "DATABASE_URL not set; this pool only sees jobs submitted to its own in-memory store"
        );
    }

    // Initialize Prometheus metrics, served on their own listener if configured
    match &config.worker_metrics_addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .expect("Failed to start Prometheus exporter");
            tracing::info!("Serving worker metrics on {}", addr);
        }
        None => {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus metrics recorder");
        }
    }
    caption_pipeline::services::describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize worker state");

    let shutdown = CancellationToken::new();
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let prefix = format!("{}-{}", hostname, std::process::id());
    let workers = state
        .orchestrator
        .spawn_workers(config.worker_count.max(1), &prefix, shutdown.clone());

    tracing::info!(workers = workers.len(), "Worker pool ready, processing jobs");

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received, draining workers"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Worker pool stopped");
}
