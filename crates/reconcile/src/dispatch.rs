//! Forwarding authenticated events to a tenant's downstream worker

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::store::BindingStore;

type HmacSha256 = Hmac<Sha256>;

const DOWNSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

pub const TENANT_HEADER: &str = "x-hookrelay-tenant";
pub const SIGNATURE_HEADER: &str = "x-hookrelay-signature";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No downstream target configured")]
    NotConfigured,

    #[error("Downstream unreachable: {0}")]
    Unreachable(String),

    #[error("Downstream timed out")]
    Timeout,

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error(transparent)]
    Store(#[from] ReconcileError),
}

/// What the downstream answered, passed back to the caller unchanged
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// `sha256=<hex>` HMAC of the body under the target's shared secret
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn valid_channel(channel: &str) -> bool {
    !channel.is_empty()
        && channel.len() <= 64
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Clone)]
pub struct DispatchRouter {
    bindings: Arc<dyn BindingStore>,
    client: reqwest::Client,
}

impl DispatchRouter {
    pub fn new(bindings: Arc<dyn BindingStore>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(DOWNSTREAM_TIMEOUT)
            .build()
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?;
        Ok(Self { bindings, client })
    }

    pub async fn dispatch(
        &self,
        binding_id: Uuid,
        channel: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<DispatchResponse, DispatchError> {
        if !valid_channel(channel) {
            return Err(DispatchError::InvalidChannel(channel.to_string()));
        }

        let target = match self.bindings.downstream_target(binding_id).await? {
            Some(target) if target.is_active => target,
            _ => return Err(DispatchError::NotConfigured),
        };

        // Join relative to the full base path, not its parent
        let base = if target.base_url.ends_with('/') {
            target.base_url.clone()
        } else {
            format!("{}/", target.base_url)
        };
        let url = Url::parse(&base)
            .and_then(|base| base.join(&format!("webhooks/{}", channel)))
            .map_err(|e| {
                tracing::warn!(binding_id = %binding_id, error = %e, "Invalid downstream base URL");
                DispatchError::NotConfigured
            })?;

        let signature = sign_body(&target.shared_secret, &body);
        let response = self
            .client
            .post(url)
            .bearer_auth(&target.shared_secret)
            .header(TENANT_HEADER, binding_id.to_string())
            .header(SIGNATURE_HEADER, signature)
            .header(
                reqwest::header::CONTENT_TYPE,
                content_type.unwrap_or("application/json"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout
            } else {
                DispatchError::Unreachable(e.to_string())
            }
        })?;

        tracing::info!(
            binding_id = %binding_id,
            channel,
            status,
            "Event dispatched downstream"
        );

        Ok(DispatchResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }
}
