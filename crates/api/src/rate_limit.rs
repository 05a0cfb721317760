//! Rate-limit middleware, one entry point per profile

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use hookrelay_shared::{client_identifier, RateLimitDecision, RateLimitProfile};

use crate::{error::ApiError, state::AppState};

/// Client identifier from `X-Forwarded-For`, or the shared unknown bucket
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    client_identifier(
        headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok()),
    )
}

async fn enforce(
    profile: RateLimitProfile,
    state: &AppState,
    request: Request,
    next: Next,
) -> Response {
    let client = extract_client_ip(request.headers());

    match state.rate_limiter.check(&client, profile).await {
        Ok(RateLimitDecision::Allowed { .. }) => next.run(request).await,
        Ok(decision @ RateLimitDecision::Limited { .. }) => {
            let retry_after_seconds = decision.retry_after_seconds().unwrap_or(1);
            tracing::warn!(
                client = %client,
                profile = profile.as_str(),
                path = %request.uri().path(),
                retry_after_seconds,
                "Rate limit exceeded"
            );
            ApiError::RateLimited {
                retry_after_seconds,
            }
            .into_response()
        }
        Err(e) => {
            // Counter store down: let the request through
            tracing::error!(
                client = %client,
                profile = profile.as_str(),
                error = %e,
                "Rate limit check failed, allowing request"
            );
            next.run(request).await
        }
    }
}

pub async fn webhook_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    enforce(RateLimitProfile::Webhook, &state, request, next).await
}

pub async fn payment_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    enforce(RateLimitProfile::Payment, &state, request, next).await
}

pub async fn strict_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    enforce(RateLimitProfile::Strict, &state, request, next).await
}

pub async fn default_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    enforce(RateLimitProfile::Default, &state, request, next).await
}
