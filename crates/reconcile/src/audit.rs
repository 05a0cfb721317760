//! Append-only reconciliation audit log

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::model::AuditEntry;
use crate::store::{AuditStore, NewAuditEntry};

/// Every step the payment reconciler can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Received,
    Fetched,
    FetchFailed,
    Resolved,
    Created,
    Attached,
    Unresolved,
    UnmappedStatus,
    ReferenceConflict,
    TransitionApplied,
    TransitionSkipped,
    TransitionRejected,
    CascadeApplied,
    CascadeSkipped,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Received => "received",
            AuditStage::Fetched => "fetched",
            AuditStage::FetchFailed => "fetch_failed",
            AuditStage::Resolved => "resolved",
            AuditStage::Created => "created",
            AuditStage::Attached => "attached",
            AuditStage::Unresolved => "unresolved",
            AuditStage::UnmappedStatus => "unmapped_status",
            AuditStage::ReferenceConflict => "reference_conflict",
            AuditStage::TransitionApplied => "transition_applied",
            AuditStage::TransitionSkipped => "transition_skipped",
            AuditStage::TransitionRejected => "transition_rejected",
            AuditStage::CascadeApplied => "cascade_applied",
            AuditStage::CascadeSkipped => "cascade_skipped",
        }
    }
}

impl std::fmt::Display for AuditStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for one audit row
#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    entry: NewAuditEntry,
}

impl AuditEntryBuilder {
    pub fn new(binding_id: Uuid, stage: AuditStage) -> Self {
        Self {
            entry: NewAuditEntry {
                binding_id,
                inbound_event_id: None,
                order_id: None,
                payment_id: None,
                external_payment_id: None,
                stage: stage.as_str().to_string(),
                detail: serde_json::json!({}),
            },
        }
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.entry.detail = detail;
        self
    }

    pub fn inbound_event(mut self, event_id: Option<Uuid>) -> Self {
        self.entry.inbound_event_id = event_id;
        self
    }

    pub fn order(mut self, order_id: Option<Uuid>) -> Self {
        self.entry.order_id = order_id;
        self
    }

    pub fn payment(mut self, payment_id: Uuid) -> Self {
        self.entry.payment_id = Some(payment_id);
        self
    }

    pub fn external_payment(mut self, external_id: impl Into<String>) -> Self {
        self.entry.external_payment_id = Some(external_id.into());
        self
    }

    pub fn build(self) -> NewAuditEntry {
        self.entry
    }
}

/// Stages passed by one reconciliation attempt, written as a single entry
#[derive(Debug, Clone)]
pub struct AuditTrail {
    binding_id: Uuid,
    inbound_event_id: Option<Uuid>,
    external_payment_id: String,
    order_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    stages: Vec<serde_json::Value>,
    last: AuditStage,
}

impl AuditTrail {
    pub fn new(
        binding_id: Uuid,
        external_payment_id: &str,
        inbound_event_id: Option<Uuid>,
    ) -> Self {
        Self {
            binding_id,
            inbound_event_id,
            external_payment_id: external_payment_id.to_string(),
            order_id: None,
            payment_id: None,
            stages: Vec::new(),
            last: AuditStage::Received,
        }
    }

    /// Append a stage. Object details are flattened next to the stage name.
    pub fn push(&mut self, stage: AuditStage, detail: serde_json::Value) {
        let mut step = serde_json::Map::new();
        step.insert("stage".to_string(), stage.as_str().into());
        match detail {
            serde_json::Value::Object(fields) => step.extend(fields),
            serde_json::Value::Null => {}
            other => {
                step.insert("detail".to_string(), other);
            }
        }
        self.stages.push(serde_json::Value::Object(step));
        self.last = stage;
    }

    pub fn set_order(&mut self, order_id: Option<Uuid>) {
        if order_id.is_some() {
            self.order_id = order_id;
        }
    }

    pub fn set_payment(&mut self, payment_id: Uuid) {
        self.payment_id = Some(payment_id);
    }

    pub fn last_stage(&self) -> AuditStage {
        self.last
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|s| s.get("stage").and_then(|v| v.as_str()))
            .collect()
    }

    /// Entry for a single stage that deserves its own row, sharing this trail's keys
    pub fn standalone(&self, stage: AuditStage, detail: serde_json::Value) -> AuditEntryBuilder {
        let builder = AuditEntryBuilder::new(self.binding_id, stage)
            .inbound_event(self.inbound_event_id)
            .order(self.order_id)
            .external_payment(self.external_payment_id.clone())
            .detail(detail);
        match self.payment_id {
            Some(payment_id) => builder.payment(payment_id),
            None => builder,
        }
    }

    pub fn into_entry(self) -> AuditEntryBuilder {
        let builder = AuditEntryBuilder::new(self.binding_id, self.last)
            .inbound_event(self.inbound_event_id)
            .order(self.order_id)
            .external_payment(self.external_payment_id)
            .detail(serde_json::json!({ "stages": self.stages }));
        match self.payment_id {
            Some(payment_id) => builder.payment(payment_id),
            None => builder,
        }
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn log_entry(&self, builder: AuditEntryBuilder) -> ReconcileResult<()> {
        let entry = builder.build();
        tracing::debug!(
            binding_id = %entry.binding_id,
            stage = %entry.stage,
            external_payment_id = ?entry.external_payment_id,
            "Reconciliation audit"
        );
        self.store.append_audit(&entry).await
    }

    /// Like [`log_entry`](Self::log_entry) but a write failure is only logged
    pub async fn record(&self, builder: AuditEntryBuilder) {
        if let Err(e) = self.log_entry(builder).await {
            tracing::warn!(error = %e, "Failed to write reconciliation audit entry");
        }
    }

    pub async fn entries(
        &self,
        binding_id: Uuid,
        external_payment_id: Option<&str>,
    ) -> ReconcileResult<Vec<AuditEntry>> {
        self.store.list_audit(binding_id, external_payment_id).await
    }
}
