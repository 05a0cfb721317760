//! Reconciliation invariants
//!
//! Runnable consistency checks over orders, payments, bindings and inbound
//! events. Run hourly by the worker and on demand from the admin API.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is one SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// Minutes after which an unprocessed inbound event counts as stuck
pub const STALE_EVENT_MINUTES: i64 = 15;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Bindings affected
    pub binding_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money state is wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ApprovedWithoutDateRow {
    payment_id: Uuid,
    binding_id: Uuid,
    external_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderWithoutPaymentRow {
    order_id: Uuid,
    binding_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct TerminalMismatchRow {
    payment_id: Uuid,
    order_id: Uuid,
    binding_id: Uuid,
    payment_status: String,
    order_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedSecretRow {
    binding_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleEventsRow {
    binding_id: Uuid,
    source: String,
    event_count: i64,
    oldest: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> ReconcileResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_approved_payment_has_approved_at().await?);
        violations.extend(self.check_approved_order_has_approved_payment().await?);
        violations.extend(self.check_terminal_payment_order_consistent().await?);
        violations.extend(self.check_binding_secret_unique().await?);
        violations.extend(self.check_stale_pending_events().await?);

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: every approved payment has an approval timestamp
    async fn check_approved_payment_has_approved_at(
        &self,
    ) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<ApprovedWithoutDateRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, binding_id, external_id
            FROM payments
            WHERE status = 'approved' AND approved_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_payment_has_approved_at".to_string(),
                binding_ids: vec![row.binding_id],
                description: "Approved payment has no approval timestamp".to_string(),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "external_id": row.external_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: an approved order has at least one approved payment
    ///
    /// Orders only become approved through the payment cascade.
    async fn check_approved_order_has_approved_payment(
        &self,
    ) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderWithoutPaymentRow> = sqlx::query_as(
            r#"
            SELECT o.id AS order_id, o.binding_id
            FROM orders o
            WHERE o.status = 'approved'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.order_id = o.id AND p.status = 'approved'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_order_has_approved_payment".to_string(),
                binding_ids: vec![row.binding_id],
                description: "Approved order has no approved payment".to_string(),
                context: serde_json::json!({ "order_id": row.order_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: an order with an approved payment is approved
    ///
    /// Rejected or cancelled payments may coexist with a later approval, so
    /// only the approved direction is strict.
    async fn check_terminal_payment_order_consistent(
        &self,
    ) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<TerminalMismatchRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, o.id AS order_id, o.binding_id,
                   p.status AS payment_status, o.status AS order_status
            FROM payments p
            JOIN orders o ON o.id = p.order_id
            WHERE p.status = 'approved' AND o.status <> 'approved'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_payment_order_consistent".to_string(),
                binding_ids: vec![row.binding_id],
                description: format!(
                    "Payment is '{}' but its order is '{}'",
                    row.payment_status, row.order_status
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "order_id": row.order_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: no two bindings share a webhook secret
    async fn check_binding_secret_unique(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedSecretRow> = sqlx::query_as(
            r#"
            SELECT ARRAY_AGG(id) AS binding_ids
            FROM integration_bindings
            WHERE webhook_secret IS NOT NULL
            GROUP BY webhook_secret
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // Never include the secret itself in the report
        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "binding_secret_unique".to_string(),
                description: format!("{} bindings share one webhook secret", row.binding_ids.len()),
                context: serde_json::json!({ "binding_count": row.binding_ids.len() }),
                binding_ids: row.binding_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: no inbound event stays unprocessed past the sweep threshold
    async fn check_stale_pending_events(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleEventsRow> = sqlx::query_as(
            r#"
            SELECT binding_id, source, COUNT(*) AS event_count, MIN(received_at) AS oldest
            FROM inbound_events
            WHERE processed_at IS NULL
              AND received_at < NOW() - ($1 || ' minutes')::INTERVAL
            GROUP BY binding_id, source
            "#,
        )
        .bind(STALE_EVENT_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_pending_events".to_string(),
                binding_ids: vec![row.binding_id],
                description: format!(
                    "{} '{}' events unprocessed for more than {} minutes",
                    row.event_count, row.source, STALE_EVENT_MINUTES
                ),
                context: serde_json::json!({
                    "source": row.source,
                    "event_count": row.event_count,
                    "oldest_received_at": row.oldest.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> ReconcileResult<Vec<InvariantViolation>> {
        match name {
            "approved_payment_has_approved_at" => {
                self.check_approved_payment_has_approved_at().await
            }
            "approved_order_has_approved_payment" => {
                self.check_approved_order_has_approved_payment().await
            }
            "terminal_payment_order_consistent" => {
                self.check_terminal_payment_order_consistent().await
            }
            "binding_secret_unique" => self.check_binding_secret_unique().await,
            "stale_pending_events" => self.check_stale_pending_events().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "approved_payment_has_approved_at",
            "approved_order_has_approved_payment",
            "terminal_payment_order_consistent",
            "binding_secret_unique",
            "stale_pending_events",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            binding_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::json!({}),
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"approved_payment_has_approved_at"));
        assert!(checks.contains(&"stale_pending_events"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            5,
            vec![
                violation("stale_pending_events"),
                violation("stale_pending_events"),
                violation("binding_secret_unique"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(5, vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 5);
    }
}
