//! Process-local store used by tests and `STORE_BACKEND=memory`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AuditStore, BindingStore, CommerceStore, EventStore, NewAuditEntry, RecordStore};
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{
    AuditEntry, DownstreamTarget, EventFilter, InboundEvent, MutationCounts, NewOrder, NewPayment,
    Order, OrderItem, Payment, PaymentInsert, PaymentTransition, RecordCollection, RecordMutation,
    TenantBinding, TenantRecord, WebhookSecret,
};
use crate::status::{OrderStatus, PaymentStatus};

#[derive(Debug, Default)]
struct Tables {
    bindings: HashMap<Uuid, TenantBinding>,
    targets: HashMap<Uuid, DownstreamTarget>,
    events: Vec<InboundEvent>,
    orders: HashMap<Uuid, Order>,
    order_items: HashMap<Uuid, Vec<OrderItem>>,
    payments: Vec<Payment>,
    audit: Vec<AuditEntry>,
    records: Vec<TenantRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_event_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an active binding without a secret
    pub async fn add_binding(&self, user_id: Uuid, product: &str) -> TenantBinding {
        let now = OffsetDateTime::now_utc();
        let binding = TenantBinding {
            id: Uuid::new_v4(),
            user_id,
            product: product.to_string(),
            is_active: true,
            webhook_secret: None,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .write()
            .await
            .bindings
            .insert(binding.id, binding.clone());
        binding
    }

    pub async fn deactivate_binding(&self, binding_id: Uuid) {
        let mut tables = self.tables.write().await;
        if let Some(binding) = tables.bindings.get_mut(&binding_id) {
            let now = OffsetDateTime::now_utc();
            binding.is_active = false;
            binding.deactivated_at = Some(now);
            binding.updated_at = now;
        }
    }

    pub async fn set_downstream_target(&self, binding_id: Uuid, base_url: &str, shared_secret: &str) {
        let now = OffsetDateTime::now_utc();
        self.tables.write().await.targets.insert(
            binding_id,
            DownstreamTarget {
                binding_id,
                base_url: base_url.to_string(),
                shared_secret: shared_secret.to_string(),
                is_active: true,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Make every event insert fail, to exercise recorder degradation
    pub fn fail_event_writes(&self, fail: bool) {
        self.fail_event_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.read().await.payments.clone()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.tables.read().await.orders.values().cloned().collect()
    }

    pub async fn events(&self) -> Vec<InboundEvent> {
        self.tables.read().await.events.clone()
    }

    /// Backdate an event, for stale-sweep tests
    pub async fn set_event_received_at(&self, event_id: Uuid, received_at: OffsetDateTime) {
        let mut tables = self.tables.write().await;
        if let Some(event) = tables.events.iter_mut().find(|e| e.id == event_id) {
            event.received_at = received_at;
        }
    }
}

#[async_trait]
impl BindingStore for InMemoryStore {
    async fn get_binding(&self, binding_id: Uuid) -> ReconcileResult<Option<TenantBinding>> {
        Ok(self.tables.read().await.bindings.get(&binding_id).cloned())
    }

    async fn set_secret_if_absent(
        &self,
        binding_id: Uuid,
        secret: &WebhookSecret,
    ) -> ReconcileResult<Option<WebhookSecret>> {
        let mut tables = self.tables.write().await;
        let Some(binding) = tables.bindings.get_mut(&binding_id) else {
            return Ok(None);
        };
        if binding.webhook_secret.is_none() {
            binding.webhook_secret = Some(secret.clone());
            binding.updated_at = OffsetDateTime::now_utc();
        }
        Ok(binding.webhook_secret.clone())
    }

    async fn replace_secret(
        &self,
        binding_id: Uuid,
        secret: &WebhookSecret,
    ) -> ReconcileResult<bool> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .bindings
            .values()
            .any(|b| b.id != binding_id && b.webhook_secret.as_ref() == Some(secret));
        if taken {
            return Err(ReconcileError::Conflict(
                "webhook secret already in use".to_string(),
            ));
        }
        match tables.bindings.get_mut(&binding_id) {
            Some(binding) => {
                binding.webhook_secret = Some(secret.clone());
                binding.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_secret(&self, secret: &str) -> ReconcileResult<Option<TenantBinding>> {
        Ok(self
            .tables
            .read()
            .await
            .bindings
            .values()
            .find(|b| b.webhook_secret.as_ref().map(|s| s.expose()) == Some(secret))
            .cloned())
    }

    async fn downstream_target(
        &self,
        binding_id: Uuid,
    ) -> ReconcileResult<Option<DownstreamTarget>> {
        Ok(self.tables.read().await.targets.get(&binding_id).cloned())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(
        &self,
        binding_id: Uuid,
        source: &str,
        payload: &serde_json::Value,
    ) -> ReconcileResult<Uuid> {
        if self.fail_event_writes.load(Ordering::SeqCst) {
            return Err(ReconcileError::Database(
                "inbound event writes disabled".to_string(),
            ));
        }
        let event = InboundEvent {
            id: Uuid::new_v4(),
            binding_id,
            source: source.to_string(),
            payload: payload.clone(),
            received_at: OffsetDateTime::now_utc(),
            processed_at: None,
            processing_error: None,
        };
        let id = event.id;
        self.tables.write().await.events.push(event);
        Ok(id)
    }

    async fn complete_event(&self, event_id: Uuid, error: Option<&str>) -> ReconcileResult<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.processed_at.is_none())
        {
            Some(event) => {
                event.processed_at = Some(OffsetDateTime::now_utc());
                event.processing_error = error.map(String::from);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_event(&self, event_id: Uuid) -> ReconcileResult<Option<InboundEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .iter()
            .find(|e| e.id == event_id)
            .cloned())
    }

    async fn list_pending(
        &self,
        source: &str,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> ReconcileResult<Vec<InboundEvent>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<InboundEvent> = tables
            .events
            .iter()
            .filter(|e| {
                e.source == source && e.processed_at.is_none() && e.received_at < received_before
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn list_events(&self, filter: &EventFilter) -> ReconcileResult<Vec<InboundEvent>> {
        let tables = self.tables.read().await;
        let mut events: Vec<InboundEvent> = tables
            .events
            .iter()
            .filter(|e| filter.binding_id.is_none_or(|id| e.binding_id == id))
            .filter(|e| filter.outcome.is_none_or(|o| e.outcome() == o))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(events
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl CommerceStore for InMemoryStore {
    async fn create_order(&self, order: &NewOrder) -> ReconcileResult<(Order, Payment)> {
        let now = OffsetDateTime::now_utc();
        let created = Order {
            id: Uuid::new_v4(),
            binding_id: order.binding_id,
            customer_name: order.customer_name.clone(),
            customer_email: order.customer_email.clone(),
            customer_phone: order.customer_phone.clone(),
            subtotal_cents: order.subtotal_cents(),
            discount_cents: order.discount_cents,
            total_cents: order.total_cents(),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let payment = Payment {
            id: Uuid::new_v4(),
            binding_id: order.binding_id,
            order_id: Some(created.id),
            external_id: None,
            method: order.payment_method.clone(),
            status: PaymentStatus::Pending,
            amount_cents: created.total_cents,
            payer_email: Some(order.customer_email.clone()),
            payer_name: Some(order.customer_name.clone()),
            approved_at: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };

        let mut tables = self.tables.write().await;
        tables.orders.insert(created.id, created.clone());
        tables.order_items.insert(created.id, order.items.clone());
        tables.payments.push(payment.clone());
        Ok((created, payment))
    }

    async fn get_order(&self, binding_id: Uuid, order_id: Uuid) -> ReconcileResult<Option<Order>> {
        Ok(self
            .tables
            .read()
            .await
            .orders
            .get(&order_id)
            .filter(|o| o.binding_id == binding_id)
            .cloned())
    }

    async fn order_items(&self, order_id: Uuid) -> ReconcileResult<Vec<OrderItem>> {
        Ok(self
            .tables
            .read()
            .await
            .order_items
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_payment_by_external_id(
        &self,
        binding_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .iter()
            .find(|p| p.binding_id == binding_id && p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_unlinked_payment(
        &self,
        binding_id: Uuid,
        order_id: Uuid,
    ) -> ReconcileResult<Option<Payment>> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .iter()
            .filter(|p| {
                p.binding_id == binding_id && p.order_id == Some(order_id) && p.external_id.is_none()
            })
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn attach_external_id(
        &self,
        payment_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>> {
        let mut tables = self.tables.write().await;
        if tables
            .payments
            .iter()
            .any(|p| p.external_id.as_deref() == Some(external_id))
        {
            return Ok(None);
        }
        match tables
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id && p.external_id.is_none())
        {
            Some(payment) => {
                payment.external_id = Some(external_id.to_string());
                payment.updated_at = OffsetDateTime::now_utc();
                Ok(Some(payment.clone()))
            }
            None => Ok(None),
        }
    }

    async fn insert_payment(&self, payment: &NewPayment) -> ReconcileResult<PaymentInsert> {
        let mut tables = self.tables.write().await;
        if tables
            .payments
            .iter()
            .any(|p| p.external_id.as_deref() == Some(payment.external_id.as_str()))
        {
            return Ok(PaymentInsert::ExternalIdTaken);
        }
        let now = OffsetDateTime::now_utc();
        let created = Payment {
            id: Uuid::new_v4(),
            binding_id: payment.binding_id,
            order_id: Some(payment.order_id),
            external_id: Some(payment.external_id.clone()),
            method: payment.method.clone(),
            status: PaymentStatus::Pending,
            amount_cents: payment.amount_cents,
            payer_email: payment.payer_email.clone(),
            payer_name: payment.payer_name.clone(),
            approved_at: None,
            metadata: payment.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.payments.push(created.clone());
        Ok(PaymentInsert::Inserted(created))
    }

    async fn transition_payment(
        &self,
        transition: &PaymentTransition,
    ) -> ReconcileResult<Option<Payment>> {
        let mut tables = self.tables.write().await;
        match tables
            .payments
            .iter_mut()
            .find(|p| p.id == transition.payment_id && p.status == transition.from)
        {
            Some(payment) => {
                payment.status = transition.to;
                if payment.approved_at.is_none() {
                    payment.approved_at = transition.approved_at;
                }
                payment.metadata = transition.metadata.clone();
                payment.updated_at = OffsetDateTime::now_utc();
                Ok(Some(payment.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> ReconcileResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                order.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn apply_mutation(
        &self,
        binding_id: Uuid,
        mutation: &RecordMutation,
    ) -> ReconcileResult<MutationCounts> {
        let mut tables = self.tables.write().await;

        let mut deleted = 0u64;
        if let Some(scope) = &mutation.delete {
            let before = tables.records.len();
            tables.records.retain(|r| {
                !(r.binding_id == binding_id
                    && r.collection == mutation.collection
                    && scope.matches(r))
            });
            deleted = (before - tables.records.len()) as u64;
        }

        let mut inserted = 0u64;
        if let Some(record) = &mutation.insert {
            tables.records.push(TenantRecord {
                id: Uuid::new_v4(),
                binding_id,
                collection: mutation.collection,
                record_type: record.record_type.clone(),
                category: record.category.clone(),
                phone: record.phone.clone(),
                email: record.email.clone(),
                payload: record.payload.clone(),
                created_at: OffsetDateTime::now_utc(),
            });
            inserted = 1;
        }

        Ok(MutationCounts { deleted, inserted })
    }

    async fn list_records(
        &self,
        binding_id: Uuid,
        collection: RecordCollection,
    ) -> ReconcileResult<Vec<TenantRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.binding_id == binding_id && r.collection == collection)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> ReconcileResult<()> {
        self.tables.write().await.audit.push(AuditEntry {
            id: Uuid::new_v4(),
            binding_id: entry.binding_id,
            inbound_event_id: entry.inbound_event_id,
            order_id: entry.order_id,
            payment_id: entry.payment_id,
            external_payment_id: entry.external_payment_id.clone(),
            stage: entry.stage.clone(),
            detail: entry.detail.clone(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn list_audit(
        &self,
        binding_id: Uuid,
        external_payment_id: Option<&str>,
    ) -> ReconcileResult<Vec<AuditEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .audit
            .iter()
            .filter(|a| a.binding_id == binding_id)
            .filter(|a| {
                external_payment_id.is_none_or(|ext| a.external_payment_id.as_deref() == Some(ext))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::product;

    #[tokio::test]
    async fn test_secret_set_only_once() {
        let store = InMemoryStore::new();
        let binding = store.add_binding(Uuid::new_v4(), product::COMMERCE).await;

        let first = store
            .set_secret_if_absent(binding.id, &WebhookSecret::new("first"))
            .await
            .unwrap();
        let second = store
            .set_secret_if_absent(binding.id, &WebhookSecret::new("second"))
            .await
            .unwrap();

        assert_eq!(first.unwrap().expose(), "first");
        assert_eq!(second.unwrap().expose(), "first");
        assert!(store
            .set_secret_if_absent(Uuid::new_v4(), &WebhookSecret::new("x"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_complete_event_once() {
        let store = InMemoryStore::new();
        let id = store
            .insert_event(Uuid::new_v4(), "gateway", &serde_json::json!({"id": 1}))
            .await
            .unwrap();

        assert!(store.complete_event(id, Some("boom")).await.unwrap());
        assert!(!store.complete_event(id, None).await.unwrap());

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.processing_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_external_id_is_unique() {
        let store = InMemoryStore::new();
        let binding_id = Uuid::new_v4();
        let payment = NewPayment {
            binding_id,
            order_id: Uuid::new_v4(),
            external_id: "X1".to_string(),
            method: "pix".to_string(),
            amount_cents: 100,
            payer_email: None,
            payer_name: None,
            metadata: serde_json::json!({}),
        };

        assert!(matches!(
            store.insert_payment(&payment).await.unwrap(),
            PaymentInsert::Inserted(_)
        ));
        assert!(matches!(
            store.insert_payment(&payment).await.unwrap(),
            PaymentInsert::ExternalIdTaken
        ));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryStore::new();
        let binding = store.add_binding(Uuid::new_v4(), product::COMMERCE).await;
        let (_, payment) = store
            .create_order(&NewOrder {
                binding_id: binding.id,
                customer_name: "Ana".to_string(),
                customer_email: "ana@example.com".to_string(),
                customer_phone: None,
                items: vec![OrderItem {
                    name: "Item".to_string(),
                    quantity: 1,
                    unit_price_cents: 1000,
                }],
                discount_cents: 0,
                payment_method: "pix".to_string(),
            })
            .await
            .unwrap();

        let transition = PaymentTransition {
            payment_id: payment.id,
            from: PaymentStatus::Pending,
            to: PaymentStatus::Approved,
            approved_at: Some(OffsetDateTime::now_utc()),
            metadata: serde_json::json!({}),
        };
        assert!(store.transition_payment(&transition).await.unwrap().is_some());
        assert!(store.transition_payment(&transition).await.unwrap().is_none());
    }
}
