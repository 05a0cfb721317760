//! Durable record of every inbound payload
//!
//! Recording never blocks an acknowledgment: a store failure is logged and
//! the caller carries on without an event id.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::model::{EventFilter, InboundEvent};
use crate::store::EventStore;

#[derive(Clone)]
pub struct InboundEventRecorder {
    events: Arc<dyn EventStore>,
}

impl InboundEventRecorder {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Persist a payload as pending. `None` when the write failed.
    pub async fn record(
        &self,
        binding_id: Uuid,
        source: &str,
        payload: &serde_json::Value,
    ) -> Option<Uuid> {
        match self.events.insert_event(binding_id, source, payload).await {
            Ok(id) => {
                tracing::debug!(event_id = %id, binding_id = %binding_id, source, "Inbound event recorded");
                Some(id)
            }
            Err(e) => {
                tracing::error!(
                    binding_id = %binding_id,
                    source,
                    error = %e,
                    "Failed to record inbound event"
                );
                None
            }
        }
    }

    /// Set the processed timestamp and outcome. Only the first call has effect.
    pub async fn mark_processed(&self, event_id: Uuid, error: Option<&str>) -> bool {
        match self.events.complete_event(event_id, error).await {
            Ok(updated) => {
                if !updated {
                    tracing::debug!(event_id = %event_id, "Inbound event already processed");
                }
                updated
            }
            Err(e) => {
                tracing::error!(event_id = %event_id, error = %e, "Failed to mark inbound event processed");
                false
            }
        }
    }

    pub async fn get(&self, event_id: Uuid) -> ReconcileResult<Option<InboundEvent>> {
        self.events.get_event(event_id).await
    }

    /// Events from `source` still unprocessed after `older_than`
    pub async fn list_stale(
        &self,
        source: &str,
        older_than: Duration,
        limit: i64,
    ) -> ReconcileResult<Vec<InboundEvent>> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        self.events.list_pending(source, cutoff, limit).await
    }

    pub async fn list(&self, filter: &EventFilter) -> ReconcileResult<Vec<InboundEvent>> {
        self.events.list_events(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{source, EventOutcome};
    use crate::store::InMemoryStore;

    fn recorder(store: &Arc<InMemoryStore>) -> InboundEventRecorder {
        InboundEventRecorder::new(store.clone())
    }

    #[tokio::test]
    async fn test_record_then_mark_once() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = recorder(&store);
        let binding_id = Uuid::new_v4();

        let id = recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({"data": {"id": "1"}}))
            .await
            .unwrap();

        let event = recorder.get(id).await.unwrap().unwrap();
        assert_eq!(event.outcome(), EventOutcome::Pending);

        assert!(recorder.mark_processed(id, None).await);
        assert!(!recorder.mark_processed(id, Some("late failure")).await);

        let event = recorder.get(id).await.unwrap().unwrap();
        assert_eq!(event.outcome(), EventOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_none() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_event_writes(true);
        let recorder = recorder(&store);

        assert!(recorder
            .record(Uuid::new_v4(), source::RECORDS, &serde_json::json!({}))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_list_stale_only_returns_old_pending_events() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = recorder(&store);
        let binding_id = Uuid::new_v4();

        let old = recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({}))
            .await
            .unwrap();
        let fresh = recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({}))
            .await
            .unwrap();
        let old_done = recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({}))
            .await
            .unwrap();
        let old_other_source = recorder
            .record(binding_id, source::RECORDS, &serde_json::json!({}))
            .await
            .unwrap();

        let backdated = OffsetDateTime::now_utc() - time::Duration::minutes(30);
        for id in [old, old_done, old_other_source] {
            store.set_event_received_at(id, backdated).await;
        }
        recorder.mark_processed(old_done, None).await;

        let stale = recorder
            .list_stale(source::GATEWAY, Duration::from_secs(15 * 60), 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = stale.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![old]);
        assert!(!ids.contains(&fresh));
    }

    #[tokio::test]
    async fn test_list_filters_by_outcome() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = recorder(&store);
        let binding_id = Uuid::new_v4();

        let failed = recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({}))
            .await
            .unwrap();
        recorder
            .record(binding_id, source::GATEWAY, &serde_json::json!({}))
            .await
            .unwrap();
        recorder.mark_processed(failed, Some("gateway 500")).await;

        let filter = EventFilter {
            binding_id: Some(binding_id),
            outcome: Some(EventOutcome::Failed),
            limit: 50,
            offset: 0,
        };
        let listed = recorder.list(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, failed);
    }
}
