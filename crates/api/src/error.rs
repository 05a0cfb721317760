//! API error mapping

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hookrelay_reconcile::{DispatchError, OrderError, ReconcileError};
use hookrelay_shared::ValidationError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Validation failed")]
    Validation(Vec<ValidationError>),

    #[error("Invalid or missing credential")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many requests")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{0}")]
    BadGateway(String),

    #[error("Downstream timed out")]
    GatewayTimeout,

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut body = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                json!({ "error": "Internal server error" })
            }
            other => json!({ "error": other.to_string() }),
        };
        body["code"] = json!(status.as_u16());

        match &self {
            ApiError::Validation(errors) => {
                body["details"] = json!(errors);
            }
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                body["retryAfter"] = json!(retry_after_seconds);
                let mut response = (status, Json(body)).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(*retry_after_seconds),
                );
                return response;
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::NotFound(what) => ApiError::NotFound(what),
            ReconcileError::InvalidInput(message) => ApiError::BadRequest(message),
            ReconcileError::Conflict(message) => ApiError::Conflict(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotConfigured => ApiError::NotFound(err.to_string()),
            DispatchError::Unreachable(_) => ApiError::BadGateway(err.to_string()),
            DispatchError::Timeout => ApiError::GatewayTimeout,
            DispatchError::InvalidChannel(_) => ApiError::BadRequest(err.to_string()),
            DispatchError::Store(inner) => inner.into(),
        }
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(errors) => ApiError::Validation(errors),
            OrderError::Store(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_lists_every_field() {
        let response = ApiError::Validation(vec![
            ValidationError::new("type", "is required"),
            ValidationError::new("amount", "must be a number"),
        ])
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], 400);
        assert_eq!(body["details"][0]["field"], "type");
        assert_eq!(body["details"][1]["field"], "amount");
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        let body = body_json(response).await;
        assert_eq!(body["retryAfter"], 42);
    }

    #[tokio::test]
    async fn test_internal_detail_not_exposed() {
        let response = ApiError::from(ReconcileError::Database(
            "relation \"payments\" does not exist".to_string(),
        ))
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_dispatch_errors_map_to_distinct_statuses() {
        assert_eq!(
            ApiError::from(DispatchError::NotConfigured).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(DispatchError::Unreachable("refused".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(DispatchError::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
