use caption_pipeline::{app_state::AppState, config::AppConfig, routes};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing caption-pipeline server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    caption_pipeline::services::describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize application state");

    // A process-local job store is invisible to separate worker processes,
    // so the server must drive its own jobs.
    let embedded = if config.database_url.is_none() {
        config.embedded_workers.max(1)
    } else {
        config.embedded_workers
    };
    let shutdown = CancellationToken::new();
    let workers = state
        .orchestrator
        .spawn_workers(embedded, "server-worker", shutdown.clone());
    tracing::info!(workers = workers.len(), "Embedded workers started");

    let app = routes::router(state, prometheus_handle);

    tracing::info!("Starting caption-pipeline on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Server stopped");
}
