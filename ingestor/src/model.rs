use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tier of the device hierarchy. Immutable once a record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "device_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gateway,
    Endpoint,
    Sensor,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Gateway => "gateway",
            DeviceKind::Endpoint => "endpoint",
            DeviceKind::Sensor => "sensor",
        }
    }
}

/// Health of a device as derived from its last reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "device_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }
}

/// Current known state of one physical device, keyed by `device_id`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub location: Option<String>,
    pub status: DeviceStatus,
    pub parent_gateway_id: Option<String>,
    pub parent_endpoint_id: Option<String>,
    pub metadata: Value,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field-level partial update for a device record. `None` means "leave the
/// stored value untouched"; metadata keys merge into the stored object.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub location: Option<String>,
    pub status: Option<DeviceStatus>,
    pub parent_gateway_id: Option<String>,
    pub parent_endpoint_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl DeviceRecord {
    /// Applies a partial update in place. Timestamps always advance, even
    /// when no business field changed.
    pub fn apply(&mut self, update: &DeviceUpdate, now: DateTime<Utc>) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(location) = &update.location {
            self.location = Some(location.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(gateway_id) = &update.parent_gateway_id {
            self.parent_gateway_id = Some(gateway_id.clone());
        }
        if let Some(endpoint_id) = &update.parent_endpoint_id {
            self.parent_endpoint_id = Some(endpoint_id.clone());
        }
        if !update.metadata.is_empty() {
            match self.metadata.as_object_mut() {
                Some(stored) => {
                    for (key, value) in &update.metadata {
                        stored.insert(key.clone(), value.clone());
                    }
                }
                None => self.metadata = Value::Object(update.metadata.clone()),
            }
        }
        self.last_seen_at = now;
        self.updated_at = now;
    }
}

/// One immutable sensor measurement. Appended by ingestion, never mutated.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SensorReading {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// Per-device aggregate over the full reading history. Computed on demand,
/// never cached.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AggregateStats {
    pub total_readings: i64,
    pub first_reading_at: Option<DateTime<Utc>>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub distinct_sensor_types: i64,
    pub average_value: Option<f64>,
}
