//! Payment notification reconciliation
//!
//! A gateway notification only names an external payment id. Each attempt:
//!
//! 1. fetches the authoritative payment from the gateway
//! 2. maps the gateway status through the status table
//! 3. resolves the local payment (external id, else the order named by the
//!    fetched `external_reference`, attaching or creating its payment)
//! 4. applies a compare-and-set, forward-only transition
//! 5. cascades terminal outcomes onto the order
//!
//! Every attempt leaves exactly one audit entry listing the stages it went
//! through; reference conflicts get an extra entry of their own. Failures
//! never propagate to the webhook sender, who was acknowledged already.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditLogger, AuditStage, AuditTrail};
use crate::error::ReconcileResult;
use crate::gateway::{notification_payment_id, notification_reference, GatewayPayment, PaymentGateway};
use crate::model::{NewPayment, Payment, PaymentInsert, PaymentTransition};
use crate::recorder::InboundEventRecorder;
use crate::status::{map_gateway_status, OrderStatus, PaymentStatus};
use crate::store::CommerceStore;

/// A notification accepted by the webhook endpoint
#[derive(Debug, Clone)]
pub struct GatewayNotification {
    pub binding_id: Uuid,
    pub event_id: Option<Uuid>,
    pub external_payment_id: String,
    /// Order reference claimed by the notification body, never trusted
    pub notified_reference: Option<String>,
}

impl GatewayNotification {
    /// `None` when the payload does not name a payment
    pub fn from_payload(
        binding_id: Uuid,
        event_id: Option<Uuid>,
        payload: &serde_json::Value,
    ) -> Option<Self> {
        Some(Self {
            binding_id,
            event_id,
            external_payment_id: notification_payment_id(payload)?,
            notified_reference: notification_reference(payload),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Transitioned {
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        order_status: Option<OrderStatus>,
    },
    /// Payment already had the derived status
    Unchanged {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    /// Derived status would move the payment backwards or out of a terminal state
    Rejected {
        payment_id: Uuid,
        current: PaymentStatus,
        requested: PaymentStatus,
    },
    /// Another attempt changed the payment between read and write
    Superseded { payment_id: Uuid },
    Unresolved { reason: String },
}

pub struct PaymentReconciler {
    gateway: Arc<dyn PaymentGateway>,
    commerce: Arc<dyn CommerceStore>,
    audit: AuditLogger,
    recorder: InboundEventRecorder,
}

impl PaymentReconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        commerce: Arc<dyn CommerceStore>,
        audit: AuditLogger,
        recorder: InboundEventRecorder,
    ) -> Self {
        Self {
            gateway,
            commerce,
            audit,
            recorder,
        }
    }

    /// Run reconciliation in the background. The caller never awaits it.
    pub fn spawn(
        self: &Arc<Self>,
        notification: GatewayNotification,
    ) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            // Outcome and errors are logged and audited inside process()
            let _ = reconciler.process(notification).await;
        })
    }

    /// Reconcile once and mark the inbound event processed with the outcome
    pub async fn process(
        &self,
        notification: GatewayNotification,
    ) -> ReconcileResult<ReconcileOutcome> {
        let result = self.reconcile(&notification).await;

        let error = match &result {
            Ok(ReconcileOutcome::Unresolved { reason }) => Some(format!("unresolved: {}", reason)),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };

        match &result {
            Ok(outcome) => tracing::info!(
                binding_id = %notification.binding_id,
                external_payment_id = %notification.external_payment_id,
                outcome = ?outcome,
                "Payment notification reconciled"
            ),
            Err(e) => tracing::warn!(
                binding_id = %notification.binding_id,
                external_payment_id = %notification.external_payment_id,
                error = %e,
                "Payment reconciliation failed"
            ),
        }

        if let Some(event_id) = notification.event_id {
            self.recorder.mark_processed(event_id, error.as_deref()).await;
        }

        result
    }

    /// One reconciliation attempt. Writes one audit entry whatever happens.
    pub async fn reconcile(
        &self,
        notification: &GatewayNotification,
    ) -> ReconcileResult<ReconcileOutcome> {
        let mut trail = AuditTrail::new(
            notification.binding_id,
            &notification.external_payment_id,
            notification.event_id,
        );
        trail.push(
            AuditStage::Received,
            serde_json::json!({ "notified_reference": notification.notified_reference }),
        );

        let result = self.run(notification, &mut trail).await;
        self.audit.record(trail.into_entry()).await;
        result
    }

    async fn run(
        &self,
        notification: &GatewayNotification,
        trail: &mut AuditTrail,
    ) -> ReconcileResult<ReconcileOutcome> {
        let fetched = match self
            .gateway
            .fetch_payment(&notification.external_payment_id)
            .await
        {
            Ok(payment) => payment,
            Err(e) => {
                trail.push(
                    AuditStage::FetchFailed,
                    serde_json::json!({ "error": e.to_string() }),
                );
                return Err(e);
            }
        };
        trail.push(
            AuditStage::Fetched,
            serde_json::json!({
                "gateway_status": fetched.status,
                "external_reference": fetched.external_reference,
                "date_approved": fetched.date_approved.map(|d| d.unix_timestamp()),
            }),
        );

        let mapped = map_gateway_status(&fetched.status);
        if !mapped.known {
            tracing::warn!(
                gateway_status = %fetched.status,
                external_payment_id = %notification.external_payment_id,
                "Unmapped gateway status, treating as pending"
            );
            trail.push(
                AuditStage::UnmappedStatus,
                serde_json::json!({ "gateway_status": fetched.status }),
            );
        }

        if let (Some(notified), Some(fetched_ref)) = (
            notification.notified_reference.as_deref(),
            fetched.external_reference.as_deref(),
        ) {
            if notified != fetched_ref {
                self.reference_conflict(
                    trail,
                    serde_json::json!({ "notified": notified, "fetched": fetched_ref }),
                )
                .await;
            }
        }

        let payment = match self.resolve_payment(notification, &fetched, trail).await? {
            Resolution::Found(payment) => payment,
            Resolution::Unresolved(reason) => {
                return Ok(ReconcileOutcome::Unresolved {
                    reason: reason.to_string(),
                })
            }
        };

        self.apply_transition(payment, mapped.status, &fetched, trail)
            .await
    }

    async fn reference_conflict(&self, trail: &mut AuditTrail, detail: serde_json::Value) {
        tracing::warn!(detail = %detail, "Conflicting order reference on payment notification");
        trail.push(AuditStage::ReferenceConflict, detail.clone());
        self.audit
            .record(trail.standalone(AuditStage::ReferenceConflict, detail))
            .await;
    }

    async fn resolve_payment(
        &self,
        notification: &GatewayNotification,
        fetched: &GatewayPayment,
        trail: &mut AuditTrail,
    ) -> ReconcileResult<Resolution> {
        let binding_id = notification.binding_id;
        let external_id = notification.external_payment_id.as_str();
        let fetched_order = fetched
            .external_reference
            .as_deref()
            .and_then(|r| Uuid::parse_str(r.trim()).ok());

        if let Some(payment) = self
            .commerce
            .find_payment_by_external_id(binding_id, external_id)
            .await?
        {
            trail.set_payment(payment.id);
            trail.set_order(payment.order_id);
            if let (Some(linked), Some(fetched_order)) = (payment.order_id, fetched_order) {
                if linked != fetched_order {
                    self.reference_conflict(
                        trail,
                        serde_json::json!({
                            "payment_order": linked,
                            "fetched": fetched_order,
                        }),
                    )
                    .await;
                }
            }
            trail.push(
                AuditStage::Resolved,
                serde_json::json!({ "payment_id": payment.id, "by": "external_id" }),
            );
            return Ok(Resolution::Found(payment));
        }

        let Some(order_id) = fetched_order else {
            let reason = "no order reference";
            trail.push(
                AuditStage::Unresolved,
                serde_json::json!({
                    "reason": reason,
                    "external_reference": fetched.external_reference,
                }),
            );
            return Ok(Resolution::Unresolved(reason));
        };

        let Some(order) = self.commerce.get_order(binding_id, order_id).await? else {
            let reason = "order not found";
            trail.push(
                AuditStage::Unresolved,
                serde_json::json!({ "reason": reason, "order_id": order_id }),
            );
            return Ok(Resolution::Unresolved(reason));
        };
        trail.set_order(Some(order.id));

        if let Some(unlinked) = self
            .commerce
            .find_unlinked_payment(binding_id, order.id)
            .await?
        {
            if let Some(payment) = self
                .commerce
                .attach_external_id(unlinked.id, external_id)
                .await?
            {
                trail.set_payment(payment.id);
                trail.push(
                    AuditStage::Attached,
                    serde_json::json!({ "payment_id": payment.id, "order_id": order.id }),
                );
                return Ok(Resolution::Found(payment));
            }
            return self.reread(binding_id, external_id, trail).await;
        }

        let new_payment = NewPayment {
            binding_id,
            order_id: order.id,
            external_id: external_id.to_string(),
            method: fetched.method(),
            amount_cents: fetched.amount_cents(),
            payer_email: fetched.payer_email(),
            payer_name: fetched.payer_name(),
            metadata: fetched.metadata(),
        };
        match self.commerce.insert_payment(&new_payment).await? {
            PaymentInsert::Inserted(payment) => {
                trail.set_payment(payment.id);
                trail.push(
                    AuditStage::Created,
                    serde_json::json!({ "payment_id": payment.id, "order_id": order.id }),
                );
                Ok(Resolution::Found(payment))
            }
            PaymentInsert::ExternalIdTaken => self.reread(binding_id, external_id, trail).await,
        }
    }

    /// A concurrent attempt linked the external id first; use its payment
    async fn reread(
        &self,
        binding_id: Uuid,
        external_id: &str,
        trail: &mut AuditTrail,
    ) -> ReconcileResult<Resolution> {
        match self
            .commerce
            .find_payment_by_external_id(binding_id, external_id)
            .await?
        {
            Some(payment) => {
                trail.set_payment(payment.id);
                trail.push(
                    AuditStage::Resolved,
                    serde_json::json!({ "payment_id": payment.id, "by": "reread" }),
                );
                Ok(Resolution::Found(payment))
            }
            None => {
                let reason = "external id linked elsewhere";
                trail.push(AuditStage::Unresolved, serde_json::json!({ "reason": reason }));
                Ok(Resolution::Unresolved(reason))
            }
        }
    }

    async fn apply_transition(
        &self,
        payment: Payment,
        target: PaymentStatus,
        fetched: &GatewayPayment,
        trail: &mut AuditTrail,
    ) -> ReconcileResult<ReconcileOutcome> {
        if payment.status == target {
            trail.push(
                AuditStage::TransitionSkipped,
                serde_json::json!({ "status": target }),
            );
            return Ok(ReconcileOutcome::Unchanged {
                payment_id: payment.id,
                status: target,
            });
        }

        if !payment.status.can_transition_to(target) {
            trail.push(
                AuditStage::TransitionRejected,
                serde_json::json!({ "current": payment.status, "requested": target }),
            );
            return Ok(ReconcileOutcome::Rejected {
                payment_id: payment.id,
                current: payment.status,
                requested: target,
            });
        }

        let (approved_at, approved_at_source) = match (target, fetched.date_approved) {
            (PaymentStatus::Approved, Some(date)) => (Some(date), Some("gateway")),
            (PaymentStatus::Approved, None) => (Some(OffsetDateTime::now_utc()), Some("local")),
            _ => (None, None),
        };

        let mut metadata = match payment.metadata.clone() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let serde_json::Value::Object(gateway_fields) = fetched.metadata() {
            metadata.extend(gateway_fields);
        }

        let transition = PaymentTransition {
            payment_id: payment.id,
            from: payment.status,
            to: target,
            approved_at,
            metadata: serde_json::Value::Object(metadata),
        };

        let Some(updated) = self.commerce.transition_payment(&transition).await? else {
            trail.push(
                AuditStage::TransitionSkipped,
                serde_json::json!({ "reason": "concurrent update", "expected": payment.status }),
            );
            return Ok(ReconcileOutcome::Superseded {
                payment_id: payment.id,
            });
        };

        trail.push(
            AuditStage::TransitionApplied,
            serde_json::json!({
                "from": payment.status,
                "to": target,
                "approved_at": updated.approved_at.map(|d| d.unix_timestamp()),
                "approved_at_source": approved_at_source,
            }),
        );

        let order_status = self.cascade(&updated, target, trail).await?;

        Ok(ReconcileOutcome::Transitioned {
            payment_id: updated.id,
            from: payment.status,
            to: target,
            order_status,
        })
    }

    async fn cascade(
        &self,
        payment: &Payment,
        status: PaymentStatus,
        trail: &mut AuditTrail,
    ) -> ReconcileResult<Option<OrderStatus>> {
        let Some(target) = status.cascade_target() else {
            return Ok(None);
        };
        let Some(order_id) = payment.order_id else {
            trail.push(
                AuditStage::CascadeSkipped,
                serde_json::json!({ "reason": "payment has no order" }),
            );
            return Ok(None);
        };
        let Some(order) = self.commerce.get_order(payment.binding_id, order_id).await? else {
            trail.push(
                AuditStage::CascadeSkipped,
                serde_json::json!({ "reason": "order not found", "order_id": order_id }),
            );
            return Ok(None);
        };

        if !order.status.accepts_cascade(target) {
            trail.push(
                AuditStage::CascadeSkipped,
                serde_json::json!({ "order_status": order.status, "requested": target }),
            );
            return Ok(Some(order.status));
        }

        if self
            .commerce
            .update_order_status(order.id, order.status, target)
            .await?
        {
            trail.push(
                AuditStage::CascadeApplied,
                serde_json::json!({ "order_id": order.id, "from": order.status, "to": target }),
            );
            Ok(Some(target))
        } else {
            trail.push(
                AuditStage::CascadeSkipped,
                serde_json::json!({ "reason": "concurrent update", "expected": order.status }),
            );
            Ok(None)
        }
    }
}

enum Resolution {
    Found(Payment),
    Unresolved(&'static str),
}
