//! Operator endpoints, all behind [`crate::auth::require_admin`]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Extension, Json,
};
use hookrelay_reconcile::{
    EventFilter, EventOutcome, InboundEvent, InvariantCheckSummary, InvariantChecker,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_body;
use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretAction {
    /// Current secret, if any
    Get,
    /// Issue one only if none exists
    Ensure,
    /// Replace unconditionally
    Rotate,
}

#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    pub action: SecretAction,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub binding_id: Uuid,
    pub action: SecretAction,
    pub webhook_secret: Option<String>,
}

pub async fn webhook_secret(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminUser>,
    Path(binding_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<SecretResponse>> {
    let request: SecretRequest = parse_body(&body)?;
    let credentials = &state.services.credentials;

    let secret = match request.action {
        SecretAction::Get => credentials.get(binding_id).await?,
        SecretAction::Ensure => Some(credentials.issue(binding_id).await?),
        SecretAction::Rotate => Some(credentials.rotate(binding_id).await?),
    };

    tracing::info!(
        admin = %admin.subject,
        binding_id = %binding_id,
        action = ?request.action,
        has_secret = secret.is_some(),
        "Webhook secret operation"
    );

    Ok(Json(SecretResponse {
        binding_id,
        action: request.action,
        webhook_secret: secret.map(|s| s.into_inner()),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub binding_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<InboundEvent>,
    pub count: usize,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let outcome = query
        .status
        .as_deref()
        .map(str::parse::<EventOutcome>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let filter = EventFilter {
        binding_id: query.binding_id,
        outcome,
        limit: query
            .limit
            .unwrap_or(DEFAULT_EVENT_LIMIT)
            .clamp(1, MAX_EVENT_LIMIT),
        offset: query.offset.unwrap_or(0).max(0),
    };

    let events = state.services.recorder.list(&filter).await?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

#[derive(Debug, Deserialize)]
pub struct InvariantsQuery {
    /// Run a single named check instead of all of them
    pub check: Option<String>,
}

pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantsQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state.invariants.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("Invariant checks require the Postgres store".to_string())
    })?;

    let summary = match query.check.as_deref() {
        None => checker.run_all_checks().await?,
        Some(name) => {
            if !InvariantChecker::available_checks().contains(&name) {
                return Err(ApiError::BadRequest(format!("Unknown check: {}", name)));
            }
            InvariantCheckSummary::from_violations(1, checker.run_check(name).await?)
        }
    };

    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Invariant violations found"
        );
    }

    Ok(Json(summary))
}
