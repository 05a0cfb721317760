//! Reconciliation error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gateway request failed: {0}")]
    GatewayUnavailable(String),

    #[error("Gateway returned {status}: {message}")]
    GatewayRejected { status: u16, message: String },

    #[error("Gateway response could not be parsed: {0}")]
    GatewayResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Serialization(err.to_string())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
