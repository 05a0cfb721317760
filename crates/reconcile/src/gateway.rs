//! Payment gateway client
//!
//! The gateway is the source of truth for payment facts. Notifications only
//! tell us which payment to look at; status, amount, approval date and the
//! order reference are always read back through [`PaymentGateway::fetch_payment`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{ReconcileError, ReconcileResult};

pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.mercadopago.com";

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Authoritative payment state as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayment {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient_rfc3339")]
    pub date_approved: Option<OffsetDateTime>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub payment_type_id: Option<String>,
    #[serde(default)]
    pub payer: Option<GatewayPayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayPayer {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl GatewayPayment {
    /// Amount in cents, rounded
    pub fn amount_cents(&self) -> i64 {
        self.transaction_amount
            .filter(|a| a.is_finite() && *a >= 0.0)
            .map(|a| (a * 100.0).round() as i64)
            .unwrap_or(0)
    }

    pub fn payer_email(&self) -> Option<String> {
        self.payer.as_ref().and_then(|p| p.email.clone())
    }

    pub fn payer_name(&self) -> Option<String> {
        let payer = self.payer.as_ref()?;
        let name = [payer.first_name.as_deref(), payer.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!name.is_empty()).then_some(name)
    }

    pub fn method(&self) -> String {
        self.payment_method_id
            .clone()
            .or_else(|| self.payment_type_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Gateway fields worth keeping on the local payment
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "gateway_status": self.status,
            "gateway_status_detail": self.status_detail,
            "payment_type_id": self.payment_type_id,
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

fn lenient_rfc3339<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match OffsetDateTime::parse(&value, &Rfc3339) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(value = %value, error = %e, "Unparseable gateway approval date");
            None
        }
    }))
}

/// Extract the payment id a notification refers to.
///
/// Accepts `{"data": {"id": ...}}` (current format) and the legacy
/// `{"topic": "payment", "resource": "<id or url>"}` / `{"type": "payment", "id": ...}`.
pub fn notification_payment_id(body: &serde_json::Value) -> Option<String> {
    fn as_id(value: &serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    if let Some(id) = body.get("data").and_then(|d| d.get("id")).and_then(as_id) {
        return Some(id);
    }

    let kind = body
        .get("type")
        .or_else(|| body.get("topic"))
        .and_then(|v| v.as_str())?;
    if kind != "payment" {
        return None;
    }

    body.get("id").and_then(as_id).or_else(|| {
        body.get("resource")
            .and_then(|v| v.as_str())
            .and_then(|r| r.rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(String::from)
    })
}

/// Order reference a notification claims, if any
pub fn notification_reference(body: &serde_json::Value) -> Option<String> {
    body.get("external_reference")
        .or_else(|| body.get("data").and_then(|d| d.get("external_reference")))
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn fetch_payment(&self, external_id: &str) -> ReconcileResult<GatewayPayment>;
}

/// Gateway client over HTTP
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, access_token: &str) -> ReconcileResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| ReconcileError::GatewayUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn fetch_payment(&self, external_id: &str) -> ReconcileResult<GatewayPayment> {
        if external_id.is_empty()
            || !external_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ReconcileError::InvalidInput(format!(
                "Invalid payment id: {}",
                external_id
            )));
        }

        let url = format!("{}/v1/payments/{}", self.base_url, external_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReconcileError::GatewayUnavailable(format!("timed out fetching payment: {}", e))
                } else {
                    ReconcileError::GatewayUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReconcileError::GatewayRejected {
                status: status.as_u16(),
                message: body.chars().take(500).collect(),
            });
        }

        response
            .json::<GatewayPayment>()
            .await
            .map_err(|e| ReconcileError::GatewayResponse(e.to_string()))
    }
}
