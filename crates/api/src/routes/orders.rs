//! Order creation for commerce bindings

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use hookrelay_reconcile::{model::product, CreateOrderRequest, CreatedOrder};

use super::{authenticate_tenant, parse_body, TokenQuery};
use crate::{error::ApiResult, state::AppState};

pub async fn create_order(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<CreatedOrder>)> {
    let binding = authenticate_tenant(&state, &query, product::COMMERCE).await?;
    let request: CreateOrderRequest = parse_body(&body)?;

    let created = state.services.orders.create(binding.id, &request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
