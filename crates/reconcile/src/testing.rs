//! Fixtures shared by the unit and edge case tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::error::{ReconcileError, ReconcileResult};
use crate::gateway::{GatewayPayment, PaymentGateway};
use crate::model::{product, AuditEntry, NewOrder, Order, OrderItem, Payment, TenantBinding};
use crate::reconciler::{GatewayNotification, PaymentReconciler};
use crate::recorder::InboundEventRecorder;
use crate::store::{CommerceStore, InMemoryStore};

/// Gateway double answering from a map of payments
#[derive(Default)]
pub struct FakeGateway {
    payments: Mutex<HashMap<String, GatewayPayment>>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn set(&self, payment: GatewayPayment) {
        self.payments
            .lock()
            .unwrap()
            .insert(payment.id.clone(), payment);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn fetch_payment(&self, external_id: &str) -> ReconcileResult<GatewayPayment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReconcileError::GatewayUnavailable(
                "connection refused".to_string(),
            ));
        }
        self.payments
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| ReconcileError::GatewayRejected {
                status: 404,
                message: "not found".to_string(),
            })
    }
}

pub fn gateway_payment(
    id: &str,
    status: &str,
    external_reference: Option<&str>,
    date_approved: Option<&str>,
) -> GatewayPayment {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "status": status,
        "external_reference": external_reference,
        "date_approved": date_approved,
        "transaction_amount": 99.9,
        "payment_method_id": "pix",
    }))
    .unwrap()
}

pub async fn pending_order(store: &InMemoryStore, binding_id: Uuid) -> (Order, Payment) {
    store
        .create_order(&NewOrder {
            binding_id,
            customer_name: "Ana Souza".to_string(),
            customer_email: "ana@example.com".to_string(),
            customer_phone: Some("+5511999990000".to_string()),
            items: vec![OrderItem {
                name: "Camiseta".to_string(),
                quantity: 1,
                unit_price_cents: 9_990,
            }],
            discount_cents: 0,
            payment_method: "pix".to_string(),
        })
        .await
        .unwrap()
}

/// A commerce binding wired to an in-memory store and a fake gateway
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub recorder: InboundEventRecorder,
    pub audit: AuditLogger,
    pub reconciler: Arc<PaymentReconciler>,
    pub binding: TenantBinding,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), FakeGateway::new()).await
    }

    pub async fn with_store(store: Arc<InMemoryStore>, gateway: FakeGateway) -> Self {
        let gateway = Arc::new(gateway);
        let recorder = InboundEventRecorder::new(store.clone());
        let audit = AuditLogger::new(store.clone());
        let reconciler = Arc::new(PaymentReconciler::new(
            gateway.clone(),
            store.clone(),
            audit.clone(),
            recorder.clone(),
        ));
        let binding = store.add_binding(Uuid::new_v4(), product::COMMERCE).await;
        Self {
            store,
            gateway,
            recorder,
            audit,
            reconciler,
            binding,
        }
    }

    pub fn notification(&self, external_id: &str) -> GatewayNotification {
        GatewayNotification {
            binding_id: self.binding.id,
            event_id: None,
            external_payment_id: external_id.to_string(),
            notified_reference: None,
        }
    }

    pub async fn payment(&self, payment_id: Uuid) -> Payment {
        self.store
            .payments()
            .await
            .into_iter()
            .find(|p| p.id == payment_id)
            .unwrap()
    }

    pub async fn order(&self, order_id: Uuid) -> Order {
        self.store
            .get_order(self.binding.id, order_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn audit(&self, external_id: &str) -> Vec<AuditEntry> {
        self.audit
            .entries(self.binding.id, Some(external_id))
            .await
            .unwrap()
    }
}
