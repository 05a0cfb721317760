//! Tenant webhook endpoints
//!
//! Every handler authenticates the `?token=` credential against one product,
//! records the payload as an inbound event and only then does domain work.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use hookrelay_reconcile::{
    model::{product, source},
    GatewayNotification, RecordCollection, RecordOutcome, RecordRequest,
};
use serde_json::json;

use super::{authenticate_tenant, parse_body, TokenQuery};
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Gateway payment notification: acknowledge, then reconcile in the background
pub async fn gateway_webhook(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let binding = authenticate_tenant(&state, &query, product::COMMERCE).await?;
    let payload: serde_json::Value = parse_body(&body)?;

    let services = &state.services;
    let event_id = services
        .recorder
        .record(binding.id, source::GATEWAY, &payload)
        .await;

    match GatewayNotification::from_payload(binding.id, event_id, &payload) {
        Some(notification) => {
            tracing::info!(
                binding_id = %binding.id,
                external_payment_id = %notification.external_payment_id,
                "Gateway notification accepted"
            );
            // Not awaited: the sender gets its 200 whatever the gateway does
            let _ = services.reconciler.spawn(notification);
        }
        None => {
            tracing::info!(binding_id = %binding.id, "Gateway notification names no payment, ignored");
            if let Some(event_id) = event_id {
                services
                    .recorder
                    .mark_processed(event_id, Some("ignored: no payment id"))
                    .await;
            }
        }
    }

    Ok(Json(json!({ "received": true })))
}

pub async fn financial_records(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<RecordOutcome>> {
    apply_records(&state, &query, &body, RecordCollection::FinancialEntries).await
}

pub async fn contact_records(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<RecordOutcome>> {
    apply_records(&state, &query, &body, RecordCollection::Contacts).await
}

async fn apply_records(
    state: &AppState,
    query: &TokenQuery,
    body: &Bytes,
    collection: RecordCollection,
) -> ApiResult<Json<RecordOutcome>> {
    let binding = authenticate_tenant(state, query, collection.product()).await?;
    let payload: serde_json::Value = parse_body(body)?;

    let services = &state.services;
    let event_id = services
        .recorder
        .record(binding.id, source::RECORDS, &payload)
        .await;

    let result = match RecordRequest::parse(collection, &payload) {
        Ok(request) => services
            .records
            .apply(binding.id, &request)
            .await
            .map_err(ApiError::from),
        Err(errors) => Err(ApiError::Validation(errors)),
    };

    if let Some(event_id) = event_id {
        let error = result.as_ref().err().map(|e| e.to_string());
        services
            .recorder
            .mark_processed(event_id, error.as_deref())
            .await;
    }

    result.map(Json)
}

/// Forward a messaging event to the tenant's downstream worker
pub async fn dispatch_webhook(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let binding = authenticate_tenant(&state, &query, product::MESSAGING).await?;
    let payload: serde_json::Value = parse_body(&body)?;

    let services = &state.services;
    let event_id = services
        .recorder
        .record(binding.id, source::MESSAGING_PROVIDER, &payload)
        .await;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let result = services
        .dispatch
        .dispatch(binding.id, &channel, body.to_vec(), content_type)
        .await;

    if let Some(event_id) = event_id {
        let error = match &result {
            Ok(response) if response.status >= 400 => {
                Some(format!("downstream status {}", response.status))
            }
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        services
            .recorder
            .mark_processed(event_id, error.as_deref())
            .await;
    }

    let downstream = result?;
    let status = StatusCode::from_u16(downstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(downstream.body));
    *response.status_mut() = status;
    if let Some(value) = downstream
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}
