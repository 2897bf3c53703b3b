use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

// Wire shapes as published by the gateway firmware, legacy field names
// included. The ingestor accepts both these and the normalized spellings.

#[derive(Debug, Serialize)]
pub struct GatewayPayload {
    pub id_gateway: String,
    pub wifi_signal: String,
    pub lora_status: String,
    pub uptime: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointPayload {
    pub id: String,
    pub bateria: f64,
    pub cargando: bool,
    pub lora: String,
    pub sensores: i64,
    pub estado: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointBatch {
    pub id_gateway: String,
    pub endpoints: Vec<EndpointPayload>,
}

#[derive(Debug, Serialize)]
pub struct SensorPayload {
    pub id: String,
    pub posicion: i64,
    pub temp: f64,
    pub humedad: f64,
    pub estado: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SensorGroup {
    pub id_endpoint: String,
    pub sensores: Vec<SensorPayload>,
}

#[derive(Debug, Serialize)]
pub struct SensorBatch {
    pub id_gateway: String,
    pub endpoints: Vec<SensorGroup>,
}

/// One simulated silo site: a gateway with `endpoints` endpoints carrying
/// `sensors_per_endpoint` cable sensors each.
pub struct Fleet {
    pub gateway_id: String,
    pub endpoints: usize,
    pub sensors_per_endpoint: usize,
    uptime_secs: u64,
}

impl Fleet {
    pub fn new(gateway_id: String, endpoints: usize, sensors_per_endpoint: usize) -> Self {
        Self {
            gateway_id,
            endpoints,
            sensors_per_endpoint,
            uptime_secs: 0,
        }
    }

    pub fn tick(&mut self, seconds: u64) {
        self.uptime_secs += seconds;
    }

    pub fn gateway_payload(&self, rng: &mut impl Rng) -> GatewayPayload {
        let lora_status = if rng.gen_bool(0.95) { "ok" } else { "warning" };
        GatewayPayload {
            id_gateway: self.gateway_id.clone(),
            wifi_signal: ["excelente", "buena", "regular"][rng.gen_range(0..3)].to_string(),
            lora_status: lora_status.to_string(),
            uptime: format_uptime(self.uptime_secs),
        }
    }

    pub fn endpoint_batch(&self, rng: &mut impl Rng) -> EndpointBatch {
        let endpoints = (0..self.endpoints)
            .map(|i| {
                let bateria: f64 = if rng.gen_bool(0.05) {
                    rng.gen_range(1.0..15.0) // occasional low battery
                } else {
                    rng.gen_range(30.0..100.0)
                };
                let estado = if bateria < 15.0 { "battery_low" } else { "ok" };
                EndpointPayload {
                    id: endpoint_id(&self.gateway_id, i),
                    bateria: (bateria * 10.0).round() / 10.0,
                    cargando: rng.gen_bool(0.3),
                    lora: "ok".to_string(),
                    sensores: self.sensors_per_endpoint as i64,
                    estado: estado.to_string(),
                }
            })
            .collect();
        EndpointBatch {
            id_gateway: self.gateway_id.clone(),
            endpoints,
        }
    }

    pub fn sensor_batch(&self, rng: &mut impl Rng) -> SensorBatch {
        let endpoints = (0..self.endpoints)
            .map(|i| {
                let ep = endpoint_id(&self.gateway_id, i);
                let sensores = (0..self.sensors_per_endpoint)
                    .map(|pos| {
                        let temp: f64 = if rng.gen_bool(0.03) {
                            rng.gen_range(35.0..45.0) // grain heating up
                        } else {
                            rng.gen_range(12.0..28.0)
                        };
                        let estado = if temp > 30.0 { "temp_critical_high" } else { "ok" };
                        SensorPayload {
                            id: format!("{}S{:02}", ep, pos + 1),
                            posicion: (pos + 1) as i64,
                            temp: (temp * 10.0).round() / 10.0,
                            humedad: (rng.gen_range(35.0..75.0f64) * 10.0).round() / 10.0,
                            estado: estado.to_string(),
                            timestamp: Utc::now(),
                        }
                    })
                    .collect();
                SensorGroup {
                    id_endpoint: ep,
                    sensores,
                }
            })
            .collect();
        SensorBatch {
            id_gateway: self.gateway_id.clone(),
            endpoints,
        }
    }
}

fn endpoint_id(gateway_id: &str, index: usize) -> String {
    format!("{}E{:02}", gateway_id, index + 1)
}

fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
