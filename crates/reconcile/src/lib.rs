// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! HookRelay reconciliation engine
//!
//! Turns third-party webhooks into tenant-scoped state changes.
//!
//! ## Features
//!
//! - **Credentials**: per-binding webhook secrets, issued once and rotatable
//! - **Inbound events**: every accepted delivery is persisted before processing
//! - **Payment reconciliation**: gateway notifications are re-fetched, mapped
//!   and applied through a forward-only status graph with an order cascade
//! - **Records**: add/replace/zero operations on tenant record collections
//! - **Dispatch**: signed forwarding to a tenant's downstream worker
//! - **Audit**: one audit entry per reconciliation attempt
//! - **Invariants**: runnable consistency checks

pub mod audit;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod model;
pub mod orders;
pub mod reconciler;
pub mod recorder;
pub mod records;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

// Audit
pub use audit::{AuditEntryBuilder, AuditLogger, AuditStage, AuditTrail};

// Credentials
pub use credentials::{generate_token, CredentialStore, MAX_TOKEN_LENGTH};

// Dispatch
pub use dispatch::{DispatchError, DispatchResponse, DispatchRouter};

// Error
pub use error::{ReconcileError, ReconcileResult};

// Gateway
pub use gateway::{GatewayPayment, HttpPaymentGateway, PaymentGateway, DEFAULT_GATEWAY_BASE_URL};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Model
pub use model::{
    AuditEntry, EventFilter, EventOutcome, InboundEvent, Order, Payment, RecordCollection,
    TenantBinding, WebhookSecret,
};

// Orders
pub use orders::{CreateOrderRequest, CreatedOrder, OrderError, OrderService};

// Reconciler
pub use reconciler::{GatewayNotification, PaymentReconciler, ReconcileOutcome};

// Recorder
pub use recorder::InboundEventRecorder;

// Records
pub use records::{RecordOperation, RecordOperator, RecordOutcome, RecordRequest};

// Status
pub use status::{map_gateway_status, OrderStatus, PaymentStatus};

// Store
pub use store::{InMemoryStore, PgStore, Stores};

use std::sync::Arc;

/// Every service the API and worker need, wired to one set of stores
#[derive(Clone)]
pub struct ReconcileServices {
    pub stores: Stores,
    pub credentials: CredentialStore,
    pub recorder: InboundEventRecorder,
    pub audit: AuditLogger,
    pub reconciler: Arc<PaymentReconciler>,
    pub records: RecordOperator,
    pub dispatch: DispatchRouter,
    pub orders: OrderService,
}

impl ReconcileServices {
    pub fn new(stores: Stores, gateway: Arc<dyn PaymentGateway>) -> Result<Self, DispatchError> {
        let recorder = InboundEventRecorder::new(stores.events.clone());
        let audit = AuditLogger::new(stores.audit.clone());
        let reconciler = Arc::new(PaymentReconciler::new(
            gateway,
            stores.commerce.clone(),
            audit.clone(),
            recorder.clone(),
        ));

        Ok(Self {
            credentials: CredentialStore::new(stores.bindings.clone()),
            records: RecordOperator::new(stores.records.clone()),
            dispatch: DispatchRouter::new(stores.bindings.clone())?,
            orders: OrderService::new(stores.commerce.clone()),
            recorder,
            audit,
            reconciler,
            stores,
        })
    }
}
