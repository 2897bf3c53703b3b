use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

/// Bounded, time-windowed historical query.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_id: Option<String>,
    pub limit: usize,
    pub window: Duration,
}

impl HistoryQuery {
    pub fn new(device_id: Option<String>, limit: Option<usize>, window: Option<Duration>) -> Self {
        Self {
            device_id,
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            window: window.unwrap_or(DEFAULT_WINDOW),
        }
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

/// One raw point from the time-series collaborator: a timestamp plus an open
/// set of named fields, nulls included.
#[derive(Debug, Clone)]
pub struct RawPoint {
    pub time: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Seam to the external time-series store. Points come back ordered by
/// timestamp descending, already capped by the query's window and limit.
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    async fn query_points(&self, query: &HistoryQuery) -> Result<Vec<RawPoint>>;
}

/// Uniform per-device reading shape served to HTTP readers. `fields` is
/// flattened on serialization, so consumers see one flat object.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub host: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Maps raw points into the uniform reading shape, one pass, in order.
/// `timestamp`, `topic`, and `host` are retained (the latter two defaulted to
/// "unknown" when absent); null fields are dropped; everything else copies
/// through under its original name.
pub fn translate(points: impl IntoIterator<Item = RawPoint>) -> impl Iterator<Item = HistoryRecord> {
    points.into_iter().map(|point| {
        let mut fields = point.fields;
        let topic = take_string(&mut fields, "topic").unwrap_or_else(|| "unknown".to_string());
        let host = take_string(&mut fields, "host").unwrap_or_else(|| "unknown".to_string());
        fields.retain(|_, value| !value.is_null());
        HistoryRecord {
            timestamp: point.time,
            topic,
            host,
            fields,
        }
    })
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            // Not ours to claim; leave it for the copy-through pass.
            fields.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

pub struct TimeSeriesReader<T> {
    source: T,
}

impl<T: TimeSeriesSource> TimeSeriesReader<T> {
    pub fn new(source: T) -> Self {
        Self { source }
    }

    pub async fn query_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let points = self.source.query_points(query).await?;
        Ok(translate(points).collect())
    }
}
