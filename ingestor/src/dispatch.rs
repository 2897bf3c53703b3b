use crate::broker::TopicBroker;
use crate::cache::LatestCache;
use crate::events::DeviceEvent;
use crate::metrics::{
    DEVICE_EVENTS_TOTAL, INVALID_EVENTS_TOTAL, MESSAGES_TOTAL, SYNC_FAILURES_TOTAL,
};
use crate::model::DeviceKind;
use crate::store::DeviceStore;
use crate::sync::SyncEngine;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// How an inbound transport topic is handled.
enum Route {
    /// Structured device payload: decode, sync, then republish normalized.
    Device {
        kind: DeviceKind,
        publish_topic: &'static str,
    },
    /// Legacy scalar/free-form topic: parse loosely and republish as-is.
    Passthrough,
}

/// Maps raw transport topics onto handling routes. Unmapped topics are
/// passed through so the live side keeps working for topics the relational
/// model knows nothing about.
pub struct TopicMap {
    device: HashMap<String, DeviceKind>,
}

impl TopicMap {
    pub fn standard() -> Self {
        Self::from_spec("gateway/gateway=gateway,gateway/endpoint=endpoint,gateway/sensor=sensor")
    }

    /// Parses a comma-separated list of `raw_topic=kind` pairs. Pairs with
    /// an unknown kind are skipped with a warning rather than failing
    /// startup.
    pub fn from_spec(spec: &str) -> Self {
        let mut device = HashMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((topic, kind)) = pair.split_once('=') else {
                warn!(pair, "ignoring malformed device topic mapping");
                continue;
            };
            let kind = match kind.trim() {
                "gateway" => DeviceKind::Gateway,
                "endpoint" => DeviceKind::Endpoint,
                "sensor" => DeviceKind::Sensor,
                other => {
                    warn!(kind = other, "ignoring device topic mapping with unknown kind");
                    continue;
                }
            };
            device.insert(topic.trim().to_string(), kind);
        }
        Self { device }
    }

    fn route(&self, raw_topic: &str) -> Route {
        match self.device.get(raw_topic) {
            Some(&kind) => Route::Device {
                kind,
                publish_topic: publish_topic(kind),
            },
            None => Route::Passthrough,
        }
    }
}

/// Normalized republish topic for each device kind; live observers
/// subscribe to these rather than the raw transport topics.
fn publish_topic(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Gateway => "gateway-update",
        DeviceKind::Endpoint => "endpoint-update",
        DeviceKind::Sensor => "sensor-update",
    }
}

/// Ingestion entry point: every transport message lands here exactly once.
/// Device topics are decoded into typed events, reconciled against the store
/// and republished in normalized form; everything else is passed through to
/// live subscribers untouched. A failure on the durable side is logged and
/// counted on its own channel and never suppresses the live publish.
pub struct IngestionDispatcher<S> {
    sync: SyncEngine<S>,
    broker: TopicBroker,
    cache: LatestCache,
    topics: TopicMap,
}

impl<S: DeviceStore> IngestionDispatcher<S> {
    pub fn new(
        sync: SyncEngine<S>,
        broker: TopicBroker,
        cache: LatestCache,
        topics: TopicMap,
    ) -> Self {
        Self {
            sync,
            broker,
            cache,
            topics,
        }
    }

    pub async fn on_message(&self, raw_topic: &str, payload: &[u8]) {
        MESSAGES_TOTAL.inc();
        match self.topics.route(raw_topic) {
            Route::Device {
                kind,
                publish_topic,
            } => self.handle_device(raw_topic, kind, publish_topic, payload).await,
            Route::Passthrough => self.handle_passthrough(raw_topic, payload),
        }
    }

    async fn handle_device(
        &self,
        raw_topic: &str,
        kind: DeviceKind,
        publish_topic: &str,
        payload: &[u8],
    ) {
        let events = match DeviceEvent::decode(kind, payload) {
            Ok(events) => events,
            Err(e) => {
                INVALID_EVENTS_TOTAL.inc();
                warn!(topic = raw_topic, error = %e, "rejecting device payload");
                return;
            }
        };

        for event in events {
            DEVICE_EVENTS_TOTAL.inc();
            let now = Utc::now();

            match self.sync.reconcile(&event).await {
                Ok(outcome) => debug!(
                    device_id = %outcome.record().device_id,
                    status = outcome.record().status.as_str(),
                    "device record reconciled"
                ),
                Err(e) => {
                    SYNC_FAILURES_TOTAL.inc();
                    error!(
                        device_id = event.device_id(),
                        error = %e,
                        "device sync failed, live delivery continues"
                    );
                }
            }

            // Reading history is append-only and best-effort; a failed
            // append must not hold back the rest of the batch either.
            for reading in event.readings(now) {
                if let Err(e) = self.sync.store().insert_reading(&reading).await {
                    warn!(
                        device_id = event.device_id(),
                        sensor_type = %reading.sensor_type,
                        error = %e,
                        "failed to append sensor reading"
                    );
                }
            }

            let normalized = match serde_json::to_value(&event) {
                Ok(value) => value,
                Err(e) => {
                    error!(device_id = event.device_id(), error = %e, "failed to serialize event");
                    continue;
                }
            };
            let delivered = self.broker.publish(publish_topic, normalized.clone());
            debug!(
                topic = publish_topic,
                device_id = event.device_id(),
                delivered,
                "published device event"
            );
            self.cache.record(publish_topic, normalized);
        }
    }

    fn handle_passthrough(&self, raw_topic: &str, payload: &[u8]) {
        let Some(value) = parse_loose(payload) else {
            INVALID_EVENTS_TOTAL.inc();
            warn!(topic = raw_topic, "dropping non-utf8 payload");
            return;
        };
        self.broker.publish(raw_topic, value.clone());
        self.cache.record(raw_topic, value);
    }
}

/// Legacy topics carry JSON, bare numbers, or plain text; all three stay
/// readable on the live side.
fn parse_loose(payload: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        return Some(value);
    }
    let text = std::str::from_utf8(payload).ok()?.trim();
    if let Ok(number) = text.parse::<f64>() {
        return Some(json!({ "value": number, "source": "text" }));
    }
    Some(Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceStatus;
    use crate::store::memory::MemoryStore;
    use crate::sync::KindConflictPolicy;
    use serde_json::json;

    fn dispatcher(store: &MemoryStore) -> IngestionDispatcher<MemoryStore> {
        let engine = SyncEngine::new(store.clone(), KindConflictPolicy::Preserve);
        IngestionDispatcher::new(
            engine,
            TopicBroker::new(),
            LatestCache::default(),
            TopicMap::standard(),
        )
    }

    #[test]
    fn endpoint_message_syncs_and_publishes_normalized() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("endpoint-update");

            dispatcher
                .on_message(
                    "gateway/endpoint",
                    br#"{"id":"ep-1","id_gateway":"gw-1","bateria":80,"estado":"ok"}"#,
                )
                .await;

            let record = store.get("ep-1").unwrap();
            assert_eq!(record.status, DeviceStatus::Online);
            assert_eq!(record.parent_gateway_id.as_deref(), Some("gw-1"));
            assert_eq!(record.metadata["battery"], json!(80.0));

            let envelope = live.recv().await.unwrap();
            assert_eq!(envelope.payload["device_id"], json!("ep-1"));
            assert_eq!(envelope.payload["kind"], json!("endpoint"));

            let cached = dispatcher.cache.latest("endpoint-update").unwrap();
            assert_eq!(cached.payload["device_id"], json!("ep-1"));
        });
    }

    #[test]
    fn sync_failure_never_suppresses_the_live_publish() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            store.fail_all();
            let mut live = dispatcher.broker.subscribe("gateway-update");

            dispatcher
                .on_message("gateway/gateway", br#"{"id_gateway":"gw-1","lora_status":"ok"}"#)
                .await;

            assert_eq!(store.device_count(), 0);
            let envelope = live.recv().await.unwrap();
            assert_eq!(envelope.payload["device_id"], json!("gw-1"));
        });
    }

    #[test]
    fn nested_batch_fans_out_one_publish_per_device() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("sensor-update");

            dispatcher
                .on_message(
                    "gateway/sensor",
                    br#"{"id_gateway":"gw-1","endpoints":[
                        {"id_endpoint":"ep-1","sensores":[
                            {"id":"s-1","temp":21.5,"estado":"ok"},
                            {"id":"s-2","humedad":48.0,"estado":"ok"}
                        ]}
                    ]}"#,
                )
                .await;

            assert_eq!(store.device_count(), 2);
            assert_eq!(live.recv().await.unwrap().payload["device_id"], json!("s-1"));
            assert_eq!(live.recv().await.unwrap().payload["device_id"], json!("s-2"));
        });
    }

    #[test]
    fn sensor_message_appends_reading_history() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);

            dispatcher
                .on_message(
                    "gateway/sensor",
                    br#"{"id":"s-1","id_endpoint":"ep-1","temp":21.5,"humedad":48.0,"estado":"ok"}"#,
                )
                .await;

            // One reading per measured quantity.
            assert_eq!(store.reading_count(), 2);
        });
    }

    #[test]
    fn malformed_device_payload_publishes_nothing() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("endpoint-update");

            dispatcher
                .on_message("gateway/endpoint", br#"{"bateria": 80}"#)
                .await;

            assert_eq!(store.device_count(), 0);
            assert!(live.try_recv().is_none());
            assert!(dispatcher.cache.latest("endpoint-update").is_none());
        });
    }

    #[test]
    fn passthrough_topic_keeps_json_payload_as_is() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("connection");

            dispatcher
                .on_message("connection", br#"{"status":"up"}"#)
                .await;

            assert_eq!(live.recv().await.unwrap().payload, json!({"status": "up"}));
            assert_eq!(store.device_count(), 0);
        });
    }

    #[test]
    fn passthrough_text_number_is_wrapped() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("temperature");

            // Not valid JSON (leading sign), but clearly numeric text.
            dispatcher.on_message("temperature", b"+21.5").await;

            let envelope = live.recv().await.unwrap();
            assert_eq!(
                envelope.payload,
                json!({"value": 21.5, "source": "text"})
            );
            assert_eq!(
                dispatcher.cache.stats("temperature").average,
                Some(21.5)
            );
        });
    }

    #[test]
    fn custom_topic_mapping_routes_to_the_given_kind() {
        let map = TopicMap::from_spec("silo/gw=gateway, silo/probe=sensor, junk, silo/x=widget");
        assert!(matches!(
            map.route("silo/gw"),
            Route::Device { kind: DeviceKind::Gateway, .. }
        ));
        assert!(matches!(
            map.route("silo/probe"),
            Route::Device { kind: DeviceKind::Sensor, .. }
        ));
        assert!(matches!(map.route("silo/x"), Route::Passthrough));
        assert!(matches!(map.route("gateway/gateway"), Route::Passthrough));
    }

    #[test]
    fn passthrough_plain_text_survives_as_string() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let dispatcher = dispatcher(&store);
            let mut live = dispatcher.broker.subscribe("message");

            dispatcher.on_message("message", b"hatch opened").await;
            assert_eq!(live.recv().await.unwrap().payload, json!("hatch opened"));
        });
    }
}
