//! Webhook credential issuance, rotation and resolution
//!
//! A credential is 32 random bytes rendered as unpadded URL-safe base64
//! (43 characters). It is bound to exactly one tenant binding and carries no
//! information about that binding.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{TenantBinding, WebhookSecret};
use crate::store::BindingStore;

const TOKEN_BYTES: usize = 32;

/// Longest token worth looking up. Anything longer cannot be ours.
pub const MAX_TOKEN_LENGTH: usize = 128;

/// Generate a fresh 256-bit credential
pub fn generate_token() -> WebhookSecret {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    WebhookSecret::new(URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Clone)]
pub struct CredentialStore {
    bindings: Arc<dyn BindingStore>,
}

impl CredentialStore {
    pub fn new(bindings: Arc<dyn BindingStore>) -> Self {
        Self { bindings }
    }

    /// Return the binding's credential, creating one if it has none
    pub async fn issue(&self, binding_id: Uuid) -> ReconcileResult<WebhookSecret> {
        let candidate = generate_token();
        let stored = self
            .bindings
            .set_secret_if_absent(binding_id, &candidate)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("Binding {} not found", binding_id)))?;

        if stored == candidate {
            tracing::info!(binding_id = %binding_id, "Webhook credential issued");
        }
        Ok(stored)
    }

    /// Replace the credential. The previous one stops resolving immediately.
    pub async fn rotate(&self, binding_id: Uuid) -> ReconcileResult<WebhookSecret> {
        let secret = generate_token();
        if !self.bindings.replace_secret(binding_id, &secret).await? {
            return Err(ReconcileError::NotFound(format!(
                "Binding {} not found",
                binding_id
            )));
        }
        tracing::info!(binding_id = %binding_id, "Webhook credential rotated");
        Ok(secret)
    }

    pub async fn get(&self, binding_id: Uuid) -> ReconcileResult<Option<WebhookSecret>> {
        let binding = self
            .bindings
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("Binding {} not found", binding_id)))?;
        Ok(binding.webhook_secret)
    }

    /// Find the usable binding holding `token`, optionally restricted to a product.
    ///
    /// Absence, deactivation and product mismatch all return `Ok(None)`.
    pub async fn resolve(
        &self,
        token: &str,
        product: Option<&str>,
    ) -> ReconcileResult<Option<TenantBinding>> {
        if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
            return Ok(None);
        }

        let Some(binding) = self.bindings.find_by_secret(token).await? else {
            return Ok(None);
        };

        let matches = binding
            .webhook_secret
            .as_ref()
            .map(|stored| bool::from(stored.expose().as_bytes().ct_eq(token.as_bytes())))
            .unwrap_or(false);

        if !matches || !binding.is_usable() {
            return Ok(None);
        }
        if product.is_some_and(|p| p != binding.product) {
            tracing::debug!(
                binding_id = %binding.id,
                product = %binding.product,
                "Credential used against another product's endpoint"
            );
            return Ok(None);
        }

        Ok(Some(binding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::product;
    use crate::store::InMemoryStore;

    async fn setup() -> (Arc<InMemoryStore>, CredentialStore) {
        let store = Arc::new(InMemoryStore::new());
        let credentials = CredentialStore::new(store.clone());
        (store, credentials)
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.expose().len(), 43);
        assert!(token
            .expose()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(generate_token(), token);
    }

    #[tokio::test]
    async fn test_issue_is_idempotent() {
        let (store, credentials) = setup().await;
        let binding = store.add_binding(Uuid::new_v4(), product::COMMERCE).await;

        let first = credentials.issue(binding.id).await.unwrap();
        let second = credentials.issue(binding.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(credentials.get(binding.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_get_before_issue_is_none() {
        let (store, credentials) = setup().await;
        let binding = store.add_binding(Uuid::new_v4(), product::CRM).await;
        assert!(credentials.get(binding.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_binding_is_not_found() {
        let (_, credentials) = setup().await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            credentials.issue(missing).await,
            Err(ReconcileError::NotFound(_))
        ));
        assert!(matches!(
            credentials.rotate(missing).await,
            Err(ReconcileError::NotFound(_))
        ));
        assert!(matches!(
            credentials.get(missing).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_token() {
        let (store, credentials) = setup().await;
        let binding = store.add_binding(Uuid::new_v4(), product::COMMERCE).await;

        let old = credentials.issue(binding.id).await.unwrap();
        let new = credentials.rotate(binding.id).await.unwrap();
        assert_ne!(old, new);

        assert!(credentials
            .resolve(old.expose(), None)
            .await
            .unwrap()
            .is_none());
        let resolved = credentials.resolve(new.expose(), None).await.unwrap();
        assert_eq!(resolved.unwrap().id, binding.id);
    }

    #[tokio::test]
    async fn test_resolve_respects_product_and_activity() {
        let (store, credentials) = setup().await;
        let binding = store.add_binding(Uuid::new_v4(), product::FINANCE).await;
        let token = credentials.issue(binding.id).await.unwrap();

        assert!(credentials
            .resolve(token.expose(), Some(product::FINANCE))
            .await
            .unwrap()
            .is_some());
        assert!(credentials
            .resolve(token.expose(), Some(product::COMMERCE))
            .await
            .unwrap()
            .is_none());

        store.deactivate_binding(binding.id).await;
        assert!(credentials
            .resolve(token.expose(), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage_without_lookup() {
        let (_, credentials) = setup().await;
        assert!(credentials.resolve("", None).await.unwrap().is_none());
        let long = "a".repeat(MAX_TOKEN_LENGTH + 1);
        assert!(credentials.resolve(&long, None).await.unwrap().is_none());
    }
}
