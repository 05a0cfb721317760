//! Shared error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Rate limit store error: {0}")]
    RateLimitStore(String),
}

pub type SharedResult<T> = Result<T, SharedError>;
