use crate::dispatch::IngestionDispatcher;
use crate::errors::{Error, Result};
use crate::store::DeviceStore;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// Shared view of the transport connection, read by the status endpoint.
#[derive(Clone, Default)]
pub struct ConnectionStatus {
    inner: Arc<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    connected: AtomicBool,
    reconnect_attempts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub reconnect_attempts: u64,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_connected(&self) {
        self.inner.connected.store(true, Ordering::Relaxed);
    }

    fn record_error(&self, message: String) {
        self.inner.connected.store(false, Ordering::Relaxed);
        self.inner.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Some(message);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let last_error = self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        StatusSnapshot {
            connected: self.inner.connected.load(Ordering::Relaxed),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            last_error,
        }
    }
}

pub async fn run_mqtt<S: DeviceStore>(
    broker: String,
    port: u16,
    client_id: String,
    topics: Vec<String>,
    dispatcher: Arc<IngestionDispatcher<S>>,
    status: ConnectionStatus,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    for topic in &topics {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(Error::Mqtt)?;
        info!("Subscribed to {} with QoS 1", topic);
    }

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                status.set_connected();
                info!("MQTT session established");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                dispatcher.on_message(&publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                status.record_error(e.to_string());
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_starts_disconnected_and_tracks_errors() {
        let status = ConnectionStatus::new();
        let snap = status.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.last_error.is_none());

        status.set_connected();
        assert!(status.snapshot().connected);

        status.record_error("connection refused".to_string());
        let snap = status.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.last_error.as_deref(), Some("connection refused"));
    }
}
