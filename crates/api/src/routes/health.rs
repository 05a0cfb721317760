use axum::Json;
use serde_json::json;

/// Liveness only; no dependency checks
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
