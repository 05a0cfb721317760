//! Narrow persistence operations used by the reconciliation services
//!
//! Each trait covers one aggregate. [`PgStore`] implements all of them over
//! one pool; [`InMemoryStore`] implements all of them behind one lock for
//! tests and local runs without a database.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::model::{
    AuditEntry, DownstreamTarget, EventFilter, InboundEvent, MutationCounts, NewOrder, NewPayment,
    Order, OrderItem, Payment, PaymentInsert, PaymentTransition, RecordCollection, RecordMutation,
    TenantBinding, TenantRecord, WebhookSecret,
};
use crate::status::OrderStatus;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn get_binding(&self, binding_id: Uuid) -> ReconcileResult<Option<TenantBinding>>;

    /// Store `secret` only when the binding has none. Returns the secret now stored,
    /// `None` when the binding does not exist.
    async fn set_secret_if_absent(
        &self,
        binding_id: Uuid,
        secret: &WebhookSecret,
    ) -> ReconcileResult<Option<WebhookSecret>>;

    /// Overwrite the secret. Returns false when the binding does not exist.
    async fn replace_secret(&self, binding_id: Uuid, secret: &WebhookSecret)
        -> ReconcileResult<bool>;

    async fn find_by_secret(&self, secret: &str) -> ReconcileResult<Option<TenantBinding>>;

    async fn downstream_target(&self, binding_id: Uuid)
        -> ReconcileResult<Option<DownstreamTarget>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(
        &self,
        binding_id: Uuid,
        source: &str,
        payload: &serde_json::Value,
    ) -> ReconcileResult<Uuid>;

    /// Set the processed timestamp if unset. Returns false when already processed
    /// or missing.
    async fn complete_event(&self, event_id: Uuid, error: Option<&str>) -> ReconcileResult<bool>;

    async fn get_event(&self, event_id: Uuid) -> ReconcileResult<Option<InboundEvent>>;

    /// Unprocessed events received before `received_before`, oldest first
    async fn list_pending(
        &self,
        source: &str,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> ReconcileResult<Vec<InboundEvent>>;

    /// Newest first
    async fn list_events(&self, filter: &EventFilter) -> ReconcileResult<Vec<InboundEvent>>;
}

#[async_trait]
pub trait CommerceStore: Send + Sync {
    /// Order, items and a pending payment without external id, in one transaction
    async fn create_order(&self, order: &NewOrder) -> ReconcileResult<(Order, Payment)>;

    async fn get_order(&self, binding_id: Uuid, order_id: Uuid) -> ReconcileResult<Option<Order>>;

    async fn order_items(&self, order_id: Uuid) -> ReconcileResult<Vec<OrderItem>>;

    async fn find_payment_by_external_id(
        &self,
        binding_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>>;

    /// Oldest payment of the order that has no external id yet
    async fn find_unlinked_payment(
        &self,
        binding_id: Uuid,
        order_id: Uuid,
    ) -> ReconcileResult<Option<Payment>>;

    /// Set the external id only while it is unset. Returns the updated payment,
    /// `None` when another writer got there first.
    async fn attach_external_id(
        &self,
        payment_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>>;

    async fn insert_payment(&self, payment: &NewPayment) -> ReconcileResult<PaymentInsert>;

    /// Apply the transition only if the payment still has `from`.
    /// Returns the updated payment, `None` when the status moved underneath.
    async fn transition_payment(
        &self,
        transition: &PaymentTransition,
    ) -> ReconcileResult<Option<Payment>>;

    /// Compare-and-set on the order status
    async fn update_order_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> ReconcileResult<bool>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Delete the scope and insert the record atomically, scoped to the binding
    async fn apply_mutation(
        &self,
        binding_id: Uuid,
        mutation: &RecordMutation,
    ) -> ReconcileResult<MutationCounts>;

    async fn list_records(
        &self,
        binding_id: Uuid,
        collection: RecordCollection,
    ) -> ReconcileResult<Vec<TenantRecord>>;
}

/// Input for one audit row
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub binding_id: Uuid,
    pub inbound_event_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub external_payment_id: Option<String>,
    pub stage: String,
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: &NewAuditEntry) -> ReconcileResult<()>;

    /// Oldest first
    async fn list_audit(
        &self,
        binding_id: Uuid,
        external_payment_id: Option<&str>,
    ) -> ReconcileResult<Vec<AuditEntry>>;
}

/// Every store the services need, behind trait objects
#[derive(Clone)]
pub struct Stores {
    pub bindings: Arc<dyn BindingStore>,
    pub events: Arc<dyn EventStore>,
    pub commerce: Arc<dyn CommerceStore>,
    pub records: Arc<dyn RecordStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            bindings: store.clone(),
            events: store.clone(),
            commerce: store.clone(),
            records: store.clone(),
            audit: store,
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            bindings: store.clone(),
            events: store.clone(),
            commerce: store.clone(),
            records: store.clone(),
            audit: store,
        }
    }
}
