use crate::errors::{Error, Result};
use crate::model::AggregateStats;
use crate::store::DeviceStore;

/// On-demand aggregate view over a device's stored reading history.
/// `NotFound` is reserved for an unknown device id; a known device with no
/// readings yields the zero-valued aggregate instead.
pub struct StatsAggregator<S> {
    store: S,
}

impl<S: DeviceStore> StatsAggregator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn compute_stats(&self, device_id: &str) -> Result<AggregateStats> {
        if self.store.fetch(device_id).await?.is_none() {
            return Err(Error::NotFound(format!("device '{device_id}'")));
        }
        self.store.reading_stats(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, DeviceRecord, DeviceStatus, SensorReading};
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn device(id: &str) -> DeviceRecord {
        let now = Utc::now();
        DeviceRecord {
            device_id: id.to_string(),
            name: id.to_string(),
            kind: DeviceKind::Sensor,
            location: None,
            status: DeviceStatus::Online,
            parent_gateway_id: None,
            parent_endpoint_id: None,
            metadata: json!({}),
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn reading(device_id: &str, sensor_type: &str, value: f64) -> SensorReading {
        SensorReading {
            device_id: device_id.to_string(),
            sensor_type: sensor_type.to_string(),
            value,
            unit: None,
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    #[test]
    fn unknown_device_is_not_found() {
        tokio_test::block_on(async {
            let aggregator = StatsAggregator::new(MemoryStore::new());
            assert!(matches!(
                aggregator.compute_stats("ghost").await,
                Err(Error::NotFound(_))
            ));
        });
    }

    #[test]
    fn known_device_without_readings_yields_zero_state() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.seed(device("s-1"));

            let stats = StatsAggregator::new(store).compute_stats("s-1").await.unwrap();
            assert_eq!(stats.total_readings, 0);
            assert_eq!(stats.distinct_sensor_types, 0);
            assert!(stats.first_reading_at.is_none());
            assert!(stats.average_value.is_none());
        });
    }

    #[test]
    fn aggregates_cover_only_the_requested_device() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.seed(device("s-1"));
            store.seed(device("s-2"));
            for r in [
                reading("s-1", "temperature", 20.0),
                reading("s-1", "temperature", 22.0),
                reading("s-1", "humidity", 55.0),
                reading("s-2", "temperature", 99.0),
            ] {
                store.insert_reading(&r).await.unwrap();
            }

            let stats = StatsAggregator::new(store).compute_stats("s-1").await.unwrap();
            assert_eq!(stats.total_readings, 3);
            assert_eq!(stats.distinct_sensor_types, 2);
            assert!((stats.average_value.unwrap() - 97.0 / 3.0).abs() < 1e-9);
            assert!(stats.first_reading_at.unwrap() <= stats.last_reading_at.unwrap());
        });
    }
}
