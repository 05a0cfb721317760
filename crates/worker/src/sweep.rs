//! Stale gateway event sweep
//!
//! Picks up gateway notifications that were recorded but never finished,
//! e.g. after a crash between acknowledgment and reconciliation.

use std::time::Duration;

use hookrelay_reconcile::{
    model::source, GatewayNotification, InboundEventRecorder, PaymentReconciler,
    ReconcileOutcome, ReconcileResult,
};
use tracing::{info, warn};

/// Pending this long means the background attempt never completed
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_BATCH_SIZE: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub found: usize,
    pub reconciled: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// One attempt per stale event. Each event ends up processed either way.
pub async fn sweep_stale_events(
    recorder: &InboundEventRecorder,
    reconciler: &PaymentReconciler,
    batch_size: i64,
) -> ReconcileResult<SweepSummary> {
    let stale = recorder
        .list_stale(source::GATEWAY, STALE_AFTER, batch_size)
        .await?;

    let mut summary = SweepSummary {
        found: stale.len(),
        ..SweepSummary::default()
    };

    for event in stale {
        let Some(notification) =
            GatewayNotification::from_payload(event.binding_id, Some(event.id), &event.payload)
        else {
            recorder
                .mark_processed(event.id, Some("ignored: no payment id"))
                .await;
            summary.ignored += 1;
            continue;
        };

        match reconciler.process(notification).await {
            Ok(ReconcileOutcome::Unresolved { .. }) => summary.unresolved += 1,
            Ok(_) => summary.reconciled += 1,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Stale event reconciliation failed");
                summary.failed += 1;
            }
        }
    }

    if summary.found > 0 {
        info!(
            found = summary.found,
            reconciled = summary.reconciled,
            unresolved = summary.unresolved,
            failed = summary.failed,
            ignored = summary.ignored,
            "Stale event sweep complete"
        );
    }

    Ok(summary)
}
