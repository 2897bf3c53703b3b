use crate::errors::{Error, Result};
use crate::model::{DeviceKind, DeviceRecord, DeviceStatus, DeviceUpdate, SensorReading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A normalized device event, decoded once at the ingestion boundary.
/// Downstream code only ever sees these typed variants, never raw maps.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceEvent {
    Gateway(GatewayEvent),
    Endpoint(EndpointEvent),
    Sensor(SensorEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointEvent {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorEvent {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// Wire-side structs. The firmware publishes the legacy field names
// (id_gateway, bateria, temp, humedad, ...); aliases keep both spellings
// decodable. Device topics arrive either as a flat single-device object or
// as a nested batch carrying every endpoint/sensor of one gateway.

#[derive(Debug, Deserialize)]
struct GatewayWire {
    #[serde(alias = "id_gateway", alias = "gateway_id", alias = "id")]
    device_id: Option<String>,
    name: Option<String>,
    location: Option<String>,
    wifi_signal: Option<String>,
    lora_status: Option<String>,
    uptime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointWire {
    #[serde(alias = "id_endpoint", alias = "endpoint_id", alias = "id")]
    device_id: Option<String>,
    #[serde(alias = "id_gateway")]
    gateway_id: Option<String>,
    name: Option<String>,
    location: Option<String>,
    #[serde(alias = "bateria")]
    battery: Option<f64>,
    #[serde(alias = "cargando")]
    charging: Option<bool>,
    #[serde(alias = "lora")]
    lora_status: Option<String>,
    #[serde(alias = "sensores")]
    sensor_count: Option<i64>,
    #[serde(alias = "estado")]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointBatchWire {
    #[serde(alias = "id_gateway")]
    gateway_id: Option<String>,
    endpoints: Vec<EndpointWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EndpointPayloadWire {
    // Batch first: the single form matches any object.
    Batch(EndpointBatchWire),
    Single(EndpointWire),
}

#[derive(Debug, Deserialize)]
struct SensorWire {
    #[serde(alias = "id_sensor", alias = "sensor_id", alias = "id")]
    device_id: Option<String>,
    #[serde(alias = "id_gateway")]
    gateway_id: Option<String>,
    #[serde(alias = "id_endpoint")]
    endpoint_id: Option<String>,
    name: Option<String>,
    location: Option<String>,
    #[serde(alias = "posicion")]
    position: Option<i64>,
    #[serde(alias = "temp")]
    temperature: Option<f64>,
    #[serde(alias = "humedad")]
    humidity: Option<f64>,
    #[serde(alias = "estado", alias = "status")]
    health: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SensorGroupWire {
    #[serde(alias = "id_endpoint", alias = "id")]
    endpoint_id: Option<String>,
    #[serde(alias = "sensores")]
    sensors: Vec<SensorWire>,
}

#[derive(Debug, Deserialize)]
struct SensorBatchWire {
    #[serde(alias = "id_gateway")]
    gateway_id: Option<String>,
    endpoints: Vec<SensorGroupWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SensorPayloadWire {
    Batch(SensorBatchWire),
    Single(SensorWire),
}

fn require_id(id: Option<String>, kind: DeviceKind) -> Result<String> {
    match id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(Error::InvalidEvent(format!(
            "{} event without device id",
            kind.as_str()
        ))),
    }
}

impl DeviceEvent {
    /// Decodes a raw device-topic payload into one event per addressed
    /// device, in payload order. Fails as a whole when any device id is
    /// missing; a rejected payload causes no mutation anywhere.
    pub fn decode(kind: DeviceKind, payload: &[u8]) -> Result<Vec<DeviceEvent>> {
        match kind {
            DeviceKind::Gateway => {
                let wire: GatewayWire = serde_json::from_slice(payload)?;
                Ok(vec![DeviceEvent::Gateway(GatewayEvent {
                    device_id: require_id(wire.device_id, kind)?,
                    name: wire.name,
                    location: wire.location,
                    wifi_signal: wire.wifi_signal,
                    lora_status: wire.lora_status,
                    uptime: wire.uptime,
                })])
            }
            DeviceKind::Endpoint => match serde_json::from_slice(payload)? {
                EndpointPayloadWire::Batch(batch) => batch
                    .endpoints
                    .into_iter()
                    .map(|wire| endpoint_event(wire, batch.gateway_id.clone()))
                    .collect(),
                EndpointPayloadWire::Single(wire) => Ok(vec![endpoint_event(wire, None)?]),
            },
            DeviceKind::Sensor => match serde_json::from_slice(payload)? {
                SensorPayloadWire::Batch(batch) => {
                    let mut events = Vec::new();
                    for group in batch.endpoints {
                        for wire in group.sensors {
                            events.push(sensor_event(
                                wire,
                                batch.gateway_id.clone(),
                                group.endpoint_id.clone(),
                            )?);
                        }
                    }
                    Ok(events)
                }
                SensorPayloadWire::Single(wire) => Ok(vec![sensor_event(wire, None, None)?]),
            },
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Gateway(e) => &e.device_id,
            DeviceEvent::Endpoint(e) => &e.device_id,
            DeviceEvent::Sensor(e) => &e.device_id,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceEvent::Gateway(_) => DeviceKind::Gateway,
            DeviceEvent::Endpoint(_) => DeviceKind::Endpoint,
            DeviceEvent::Sensor(_) => DeviceKind::Sensor,
        }
    }

    /// Status derived from the event's health fields, or `None` when the
    /// event carries none (so a merge leaves the stored status alone).
    pub fn derived_status(&self) -> Option<DeviceStatus> {
        match self {
            DeviceEvent::Gateway(e) => e.lora_status.as_deref().map(|s| {
                if s == "ok" {
                    DeviceStatus::Online
                } else {
                    DeviceStatus::Offline
                }
            }),
            DeviceEvent::Endpoint(e) => e.status.as_deref().map(|s| match s {
                "ok" => DeviceStatus::Online,
                "battery_low" => DeviceStatus::Error,
                _ => DeviceStatus::Offline,
            }),
            DeviceEvent::Sensor(e) => e.health.as_deref().map(|s| {
                if s == "ok" {
                    DeviceStatus::Online
                } else {
                    DeviceStatus::Error
                }
            }),
        }
    }

    fn status_for_create(&self) -> DeviceStatus {
        self.derived_status().unwrap_or(match self.kind() {
            DeviceKind::Gateway | DeviceKind::Endpoint => DeviceStatus::Offline,
            DeviceKind::Sensor => DeviceStatus::Error,
        })
    }

    /// Kind-specific metadata, restricted to fields the event actually
    /// carries.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };
        match self {
            DeviceEvent::Gateway(e) => {
                put("wifi_signal", e.wifi_signal.clone().map(Value::from));
                put("lora_status", e.lora_status.clone().map(Value::from));
                put("uptime", e.uptime.clone().map(Value::from));
            }
            DeviceEvent::Endpoint(e) => {
                put("battery", e.battery.map(Value::from));
                put("charging", e.charging.map(Value::from));
                put("lora_status", e.lora_status.clone().map(Value::from));
                put("sensor_count", e.sensor_count.map(Value::from));
            }
            DeviceEvent::Sensor(e) => {
                put("position", e.position.map(Value::from));
                put("temperature", e.temperature.map(Value::from));
                put("humidity", e.humidity.map(Value::from));
                put("health", e.health.clone().map(Value::from));
            }
        }
        map
    }

    /// The partial update this event implies for an existing record.
    pub fn update(&self) -> DeviceUpdate {
        let (name, location, gateway_id, endpoint_id) = match self {
            DeviceEvent::Gateway(e) => (e.name.clone(), e.location.clone(), None, None),
            DeviceEvent::Endpoint(e) => {
                (e.name.clone(), e.location.clone(), e.gateway_id.clone(), None)
            }
            DeviceEvent::Sensor(e) => (
                e.name.clone(),
                e.location.clone(),
                e.gateway_id.clone(),
                e.endpoint_id.clone(),
            ),
        };
        DeviceUpdate {
            name,
            location,
            status: self.derived_status(),
            parent_gateway_id: gateway_id,
            parent_endpoint_id: endpoint_id,
            metadata: self.metadata(),
        }
    }

    /// A fresh record for a device seen for the first time.
    pub fn new_record(&self, now: DateTime<Utc>) -> DeviceRecord {
        let update = self.update();
        DeviceRecord {
            device_id: self.device_id().to_string(),
            name: update.name.unwrap_or_else(|| self.device_id().to_string()),
            kind: self.kind(),
            location: update.location,
            status: self.status_for_create(),
            parent_gateway_id: update.parent_gateway_id,
            parent_endpoint_id: update.parent_endpoint_id,
            metadata: Value::Object(update.metadata),
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Immutable readings carried by this event (sensor events only).
    /// Measurement time is the payload timestamp when present, otherwise
    /// the ingestion time.
    pub fn readings(&self, now: DateTime<Utc>) -> Vec<SensorReading> {
        let DeviceEvent::Sensor(e) = self else {
            return Vec::new();
        };
        let timestamp = e.timestamp.unwrap_or(now);
        let mut meta = Map::new();
        if let Some(position) = e.position {
            meta.insert("position".to_string(), json!(position));
        }
        if let Some(health) = &e.health {
            meta.insert("health".to_string(), json!(health));
        }
        let mut readings = Vec::new();
        if let Some(value) = e.temperature {
            readings.push(SensorReading {
                device_id: e.device_id.clone(),
                sensor_type: "temperature".to_string(),
                value,
                unit: Some("°C".to_string()),
                timestamp,
                metadata: Value::Object(meta.clone()),
            });
        }
        if let Some(value) = e.humidity {
            readings.push(SensorReading {
                device_id: e.device_id.clone(),
                sensor_type: "humidity".to_string(),
                value,
                unit: Some("%".to_string()),
                timestamp,
                metadata: Value::Object(meta),
            });
        }
        readings
    }
}

fn endpoint_event(wire: EndpointWire, batch_gateway: Option<String>) -> Result<DeviceEvent> {
    Ok(DeviceEvent::Endpoint(EndpointEvent {
        device_id: require_id(wire.device_id, DeviceKind::Endpoint)?,
        gateway_id: wire.gateway_id.or(batch_gateway),
        name: wire.name,
        location: wire.location,
        battery: wire.battery,
        charging: wire.charging,
        lora_status: wire.lora_status,
        sensor_count: wire.sensor_count,
        status: wire.status,
    }))
}

fn sensor_event(
    wire: SensorWire,
    batch_gateway: Option<String>,
    batch_endpoint: Option<String>,
) -> Result<DeviceEvent> {
    Ok(DeviceEvent::Sensor(SensorEvent {
        device_id: require_id(wire.device_id, DeviceKind::Sensor)?,
        gateway_id: wire.gateway_id.or(batch_gateway),
        endpoint_id: wire.endpoint_id.or(batch_endpoint),
        name: wire.name,
        location: wire.location,
        position: wire.position,
        temperature: wire.temperature,
        humidity: wire.humidity,
        health: wire.health,
        timestamp: wire.timestamp,
    }))
}
