//! HTTP routes

pub mod admin;
pub mod health;
pub mod orders;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::{
    body::Bytes,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use hookrelay_reconcile::TenantBinding;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    auth::require_admin,
    error::{ApiError, ApiResult},
    rate_limit::{default_rate_limit, payment_rate_limit, strict_rate_limit, webhook_rate_limit},
    state::AppState,
};

/// `?token=` carried by every tenant-facing route
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Resolve the credential to a usable binding of `product`, or 401
pub(crate) async fn authenticate_tenant(
    state: &AppState,
    query: &TokenQuery,
    product: &str,
) -> ApiResult<TenantBinding> {
    let token = query.token.as_deref().unwrap_or_default();
    state
        .services
        .credentials
        .resolve(token, Some(product))
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Parse a raw body, mapping any decode failure to 400
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Malformed body: {}", e)))
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.webhook_body_limit_bytes;

    // Layers run bottom-up: rate limit before auth
    let webhook_routes = Router::new()
        .route("/api/v1/webhooks/gateway", post(webhooks::gateway_webhook))
        .route(
            "/api/v1/webhooks/records/financial",
            post(webhooks::financial_records),
        )
        .route(
            "/api/v1/webhooks/records/contacts",
            post(webhooks::contact_records),
        )
        .route(
            "/api/v1/webhooks/dispatch/{channel}",
            post(webhooks::dispatch_webhook),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn_with_state(state.clone(), webhook_rate_limit));

    let order_routes = Router::new()
        .route("/api/v1/orders", post(orders::create_order))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn_with_state(state.clone(), payment_rate_limit));

    let admin_routes = Router::new()
        .route(
            "/api/v1/admin/bindings/{id}/webhook-secret",
            post(admin::webhook_secret),
        )
        .route("/api/v1/admin/events", get(admin::list_events))
        .route("/api/v1/admin/invariants", get(admin::run_invariants))
        .layer(from_fn_with_state(state.auth_state(), require_admin))
        .layer(from_fn_with_state(state.clone(), strict_rate_limit));

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .layer(from_fn_with_state(state.clone(), default_rate_limit));

    Router::new()
        .merge(webhook_routes)
        .merge(order_routes)
        .merge(admin_routes)
        .merge(health_routes)
        .with_state(state)
}
