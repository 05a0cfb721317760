//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use super::jwt::JwtManager;

/// Roles allowed on the admin API
pub const ADMIN_ROLES: &[&str] = &["admin", "superadmin"];

/// Authenticated operator, inserted into request extensions by [`require_admin`]
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub subject: String,
    pub role: String,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Extract bearer token from the Authorization header
pub(crate) fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticate a bearer token and require an admin role
pub fn authenticate_admin(auth_state: &AuthState, token: &str) -> Result<AdminUser, AuthError> {
    let claims = auth_state.jwt_manager.validate(token)?;

    if !ADMIN_ROLES.contains(&claims.role.as_str()) {
        tracing::warn!(
            subject = %claims.sub,
            role = %claims.role,
            "Admin route called without an admin role"
        );
        return Err(AuthError::InsufficientPermissions);
    }

    Ok(AdminUser {
        subject: claims.sub,
        role: claims.role,
    })
}

/// Middleware that requires an admin bearer token
pub async fn require_admin(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_admin(&auth_state, token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(admin) => {
            tracing::debug!(path = %path, subject = %admin.subject, "require_admin: authenticated");
            request.extensions_mut().insert(admin);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_admin: authentication failed");
            err.into_response()
        }
    }
}
