//! Database pool and migrations

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::SharedResult;

/// Connection attempts before giving up at startup
const CONNECT_ATTEMPTS: usize = 5;

/// Create the pool used for regular queries.
///
/// Connecting is retried with exponential backoff so the API survives a
/// database that comes up slightly after it (compose / fly deploys).
pub async fn create_pool(database_url: &str) -> SharedResult<PgPool> {
    let strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(CONNECT_ATTEMPTS);

    let pool = Retry::spawn(strategy, || async {
        PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Database connection attempt failed"))
    })
    .await?;

    Ok(pool)
}

/// Create a small pool with longer timeouts for running migrations
pub async fn create_migration_pool(database_url: &str) -> SharedResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations
pub async fn run_migrations(pool: &PgPool) -> SharedResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
