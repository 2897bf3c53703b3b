use crate::errors::{Error, Result};
use crate::events::DeviceEvent;
use crate::metrics::RECONCILE_LATENCY_SECONDS;
use crate::model::DeviceRecord;
use crate::store::{DeviceStore, InsertOutcome};
use chrono::Utc;
use tracing::{debug, warn};

/// What to do when an event claims a different kind for an existing device.
/// The stored kind is authoritative either way; `Reject` additionally fails
/// the event instead of merging the rest of its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindConflictPolicy {
    Preserve,
    Reject,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Created(DeviceRecord),
    Updated(DeviceRecord),
}

impl SyncOutcome {
    pub fn record(&self) -> &DeviceRecord {
        match self {
            SyncOutcome::Created(r) | SyncOutcome::Updated(r) => r,
        }
    }
}

/// Create-or-merge reconciliation of device events against the record store.
/// Guarantees at most one logical record per device id even when two
/// ingesters race on the first event for a device.
#[derive(Clone)]
pub struct SyncEngine<S> {
    store: S,
    kind_conflict: KindConflictPolicy,
}

impl<S: DeviceStore> SyncEngine<S> {
    pub fn new(store: S, kind_conflict: KindConflictPolicy) -> Self {
        Self {
            store,
            kind_conflict,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn reconcile(&self, event: &DeviceEvent) -> Result<SyncOutcome> {
        let start = std::time::Instant::now();
        let result = self.reconcile_inner(event).await;
        RECONCILE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        result
    }

    async fn reconcile_inner(&self, event: &DeviceEvent) -> Result<SyncOutcome> {
        // Decoding already validates ids; reconcile is a public entry point
        // and re-checks so a hand-built event cannot write an empty key.
        if event.device_id().trim().is_empty() {
            return Err(Error::InvalidEvent(
                "event without device id".to_string(),
            ));
        }

        let now = Utc::now();
        if let Some(existing) = self.store.fetch(event.device_id()).await? {
            return self.merge_into(existing, event).await;
        }

        let record = event.new_record(now);
        match self.store.insert(&record).await? {
            InsertOutcome::Inserted => {
                debug!(
                    device_id = %record.device_id,
                    kind = record.kind.as_str(),
                    "created device record"
                );
                Ok(SyncOutcome::Created(record))
            }
            InsertOutcome::DuplicateKey => {
                // Lost the create race: the row exists now, so retry as an
                // update against it instead of surfacing the violation.
                debug!(device_id = %record.device_id, "create raced, retrying as update");
                match self.store.fetch(event.device_id()).await? {
                    Some(existing) => self.merge_into(existing, event).await,
                    None => Err(Error::StoreUnavailable(sqlx::Error::RowNotFound)),
                }
            }
        }
    }

    async fn merge_into(
        &self,
        mut existing: DeviceRecord,
        event: &DeviceEvent,
    ) -> Result<SyncOutcome> {
        if existing.kind != event.kind() {
            match self.kind_conflict {
                KindConflictPolicy::Preserve => warn!(
                    device_id = %existing.device_id,
                    stored = existing.kind.as_str(),
                    claimed = event.kind().as_str(),
                    "event claims a different device kind, keeping stored kind"
                ),
                KindConflictPolicy::Reject => {
                    return Err(Error::InvalidEvent(format!(
                        "device '{}' is a {}, event claims {}",
                        existing.device_id,
                        existing.kind.as_str(),
                        event.kind().as_str()
                    )))
                }
            }
        }
        existing.apply(&event.update(), Utc::now());
        self.store.update(&existing).await?;
        Ok(SyncOutcome::Updated(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, DeviceStatus};
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn engine(store: &MemoryStore) -> SyncEngine<MemoryStore> {
        SyncEngine::new(store.clone(), KindConflictPolicy::Preserve)
    }

    fn gateway_event(payload: &str) -> DeviceEvent {
        DeviceEvent::decode(DeviceKind::Gateway, payload.as_bytes())
            .unwrap()
            .remove(0)
    }

    fn endpoint_event(payload: &str) -> DeviceEvent {
        DeviceEvent::decode(DeviceKind::Endpoint, payload.as_bytes())
            .unwrap()
            .remove(0)
    }

    #[test]
    fn first_event_creates_second_updates() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);
            let event = gateway_event(r#"{"id_gateway":"G01","lora_status":"ok"}"#);

            assert!(matches!(
                engine.reconcile(&event).await.unwrap(),
                SyncOutcome::Created(_)
            ));
            assert!(matches!(
                engine.reconcile(&event).await.unwrap(),
                SyncOutcome::Updated(_)
            ));
            assert_eq!(store.device_count(), 1);
            assert_eq!(store.get("G01").unwrap().status, DeviceStatus::Online);
        });
    }

    #[test]
    fn merge_leaves_absent_fields_untouched() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);

            let full = endpoint_event(
                r#"{"id":"E01","id_gateway":"gw-1","location":"roomA","bateria":80,"estado":"ok"}"#,
            );
            engine.reconcile(&full).await.unwrap();

            // Only a status change; location and battery must survive.
            let partial = endpoint_event(r#"{"id":"E01","estado":"battery_low"}"#);
            let before = store.get("E01").unwrap().updated_at;
            engine.reconcile(&partial).await.unwrap();

            let record = store.get("E01").unwrap();
            assert_eq!(record.status, DeviceStatus::Error);
            assert_eq!(record.location.as_deref(), Some("roomA"));
            assert_eq!(record.parent_gateway_id.as_deref(), Some("gw-1"));
            assert_eq!(record.metadata["battery"], json!(80.0));
            assert!(record.updated_at >= before);
        });
    }

    #[test]
    fn duplicate_create_race_retries_as_update() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);
            let event = gateway_event(r#"{"id_gateway":"G01","lora_status":"ok"}"#);

            // The racing writer's row only becomes visible at insert time.
            let raced = gateway_event(r#"{"id_gateway":"G01","wifi_signal":"buena"}"#)
                .new_record(Utc::now());
            store.inject_race(raced);

            let outcome = engine.reconcile(&event).await.unwrap();
            assert!(matches!(outcome, SyncOutcome::Updated(_)));
            assert_eq!(store.device_count(), 1);

            let record = store.get("G01").unwrap();
            // Both writers' fields survive the merge.
            assert_eq!(record.metadata["wifi_signal"], json!("buena"));
            assert_eq!(record.status, DeviceStatus::Online);
        });
    }

    #[test]
    fn kind_conflict_preserves_stored_kind() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);
            engine
                .reconcile(&gateway_event(r#"{"id_gateway":"dev-1","lora_status":"ok"}"#))
                .await
                .unwrap();

            let claim = DeviceEvent::decode(
                DeviceKind::Sensor,
                br#"{"id":"dev-1","temp":20.0,"estado":"ok"}"#,
            )
            .unwrap()
            .remove(0);
            let outcome = engine.reconcile(&claim).await.unwrap();
            assert!(matches!(outcome, SyncOutcome::Updated(_)));
            assert_eq!(store.get("dev-1").unwrap().kind, DeviceKind::Gateway);
        });
    }

    #[test]
    fn kind_conflict_reject_policy_fails_the_event() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = SyncEngine::new(store.clone(), KindConflictPolicy::Reject);
            engine
                .reconcile(&gateway_event(r#"{"id_gateway":"dev-1","lora_status":"ok"}"#))
                .await
                .unwrap();

            let claim = DeviceEvent::decode(
                DeviceKind::Sensor,
                br#"{"id":"dev-1","temp":20.0}"#,
            )
            .unwrap()
            .remove(0);
            assert!(matches!(
                engine.reconcile(&claim).await,
                Err(Error::InvalidEvent(_))
            ));
            assert_eq!(store.get("dev-1").unwrap().kind, DeviceKind::Gateway);
        });
    }

    #[test]
    fn store_outage_surfaces_as_store_unavailable() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);
            store.fail_all();

            let event = gateway_event(r#"{"id_gateway":"G01"}"#);
            assert!(matches!(
                engine.reconcile(&event).await,
                Err(Error::StoreUnavailable(_))
            ));
        });
    }

    #[test]
    fn missing_parent_reference_is_stored_as_given() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let engine = engine(&store);
            // gw-unknown does not exist; reconcile must not care.
            let event = endpoint_event(r#"{"id":"E09","id_gateway":"gw-unknown","estado":"ok"}"#);
            engine.reconcile(&event).await.unwrap();
            assert_eq!(
                store.get("E09").unwrap().parent_gateway_id.as_deref(),
                Some("gw-unknown")
            );
        });
    }
}
