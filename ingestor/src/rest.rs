use crate::broker::TopicBroker;
use crate::cache::LatestCache;
use crate::errors::Error;
use crate::history::{HistoryQuery, TimeSeriesReader};
use crate::influx::InfluxClient;
use crate::model::{DeviceKind, DeviceStatus};
use crate::mqtt::ConnectionStatus;
use crate::stats::StatsAggregator;
use crate::store::{DeviceStore, PgStore};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub store: PgStore,
    pub broker: TopicBroker,
    pub cache: LatestCache,
    pub reader: Arc<TimeSeriesReader<InfluxClient>>,
    pub stats: Arc<StatsAggregator<PgStore>>,
    pub mqtt_status: ConnectionStatus,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id", get(get_device))
        .route("/api/v1/devices/:device_id/readings", get(device_readings))
        .route("/api/v1/devices/:device_id/history", get(device_history))
        .route("/api/v1/devices/:device_id/stats", get(device_stats))
        .route("/api/v1/live/:class", get(live_recent))
        .route("/api/v1/live/:class/latest", get(live_latest))
        .route("/api/v1/live/:class/stats", get(live_stats))
        .route("/api/v1/live/:class/ws", get(live_stream))
        .route("/api/v1/status", get(system_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    /// Window spec such as "30m", "24h" or "7d". Defaults to 24h.
    window: Option<String>,
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    let devices = state.store.list().await?;
    Ok(Json(json!({
        "success": true,
        "data": devices,
        "count": devices.len(),
    })))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let device = state
        .store
        .fetch(&device_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("device '{device_id}'")))?;
    let stats = state.store.reading_stats(&device_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": device,
        "stats": stats,
    })))
}

async fn device_readings(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    if state.store.fetch(&device_id).await?.is_none() {
        return Err(Error::NotFound(format!("device '{device_id}'")));
    }
    let limit = params.limit.unwrap_or(100).min(1000) as i64;
    let readings = state.store.recent_readings(&device_id, limit).await?;
    Ok(Json(json!({
        "success": true,
        "data": readings,
        "count": readings.len(),
    })))
}

async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, Error> {
    let window = params.window.as_deref().map(parse_window).transpose()?;
    let query = HistoryQuery::new(Some(device_id), params.limit, window);
    let records = state.reader.query_history(&query).await?;
    Ok(Json(json!({
        "success": true,
        "data": records,
        "count": records.len(),
        "window_seconds": query.window.as_secs(),
        "source": "influxdb",
    })))
}

async fn device_stats(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let stats = state.stats.compute_stats(&device_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": stats,
    })))
}

async fn live_recent(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let entries = state.cache.recent(&class, limit);
    Json(json!({
        "success": true,
        "data": entries,
        "count": entries.len(),
    }))
}

async fn live_latest(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.cache.latest(&class),
    }))
}

async fn live_stats(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.cache.stats(&class),
    }))
}

async fn live_stream(
    State(state): State<AppState>,
    Path(class): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| forward_live(socket, state.broker, class))
}

/// Bridges one broker subscription onto a WebSocket. The subscription is
/// released as soon as the client goes away, so a stalled browser never
/// accumulates undelivered envelopes.
async fn forward_live(mut socket: WebSocket, broker: TopicBroker, class: String) {
    let mut subscription = broker.subscribe(&class);
    tracing::debug!(topic = subscription.topic(), "live stream attached");
    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else { break };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to serialize live envelope: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    subscription.unsubscribe();
}

async fn system_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    let devices = state.store.list().await?;
    let count = |kind: DeviceKind, status: Option<DeviceStatus>| {
        devices
            .iter()
            .filter(|d| d.kind == kind && status.map_or(true, |s| d.status == s))
            .count()
    };
    let mqtt = state.mqtt_status.snapshot();
    Ok(Json(json!({
        "success": true,
        "mqtt": mqtt,
        "subscriber_count": state.broker.subscriber_count(),
        "stats": {
            "total_gateways": count(DeviceKind::Gateway, None),
            "online_gateways": count(DeviceKind::Gateway, Some(DeviceStatus::Online)),
            "total_endpoints": count(DeviceKind::Endpoint, None),
            "online_endpoints": count(DeviceKind::Endpoint, Some(DeviceStatus::Online)),
            "total_sensors": count(DeviceKind::Sensor, None),
            "online_sensors": count(DeviceKind::Sensor, Some(DeviceStatus::Online)),
        },
        "timestamp": Utc::now(),
    })))
}

/// Parses a window spec like "30m", "24h" or "7d" (bare numbers are seconds).
fn parse_window(spec: &str) -> Result<Duration, Error> {
    let spec = spec.trim();
    let (digits, unit) = match spec.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => spec.split_at(pos),
        None => (spec, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidEvent(format!("invalid window '{spec}'")))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => return Err(Error::InvalidEvent(format!("invalid window '{spec}'"))),
    };
    if seconds == 0 {
        return Err(Error::InvalidEvent(format!("invalid window '{spec}'")));
    }
    Ok(Duration::from_secs(seconds))
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            Error::QueryTimeout => (StatusCode::GATEWAY_TIMEOUT, "query_timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        error!("API error: {}", self);
        (
            status,
            Json(json!({
                "success": false,
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
