use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod job_store;

pub use job_store::PgJobStore;

/// Connect to the job database. Every worker holds at most one connection
/// per in-flight store call, so `max_connections` should cover the pool size
/// plus API traffic.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(2))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply pending migrations from `./migrations`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
