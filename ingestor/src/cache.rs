use crate::broker::Envelope;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const DEFAULT_CAPACITY: usize = 50;

/// Summary of the cached window for one topic class, computed over whatever
/// numeric payloads the window holds. Non-numeric entries still count toward
/// `count` but contribute nothing to the aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct ScalarStats {
    pub count: usize,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest: Option<Envelope>,
}

/// Bounded ring of the most recent messages per topic class, fed by the
/// ingestion path so HTTP readers can serve "what happened just now" without
/// touching the durable stores.
#[derive(Clone)]
pub struct LatestCache {
    capacity: usize,
    classes: Arc<Mutex<HashMap<String, VecDeque<Envelope>>>>,
}

fn lock(
    classes: &Mutex<HashMap<String, VecDeque<Envelope>>>,
) -> MutexGuard<'_, HashMap<String, VecDeque<Envelope>>> {
    classes.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LatestCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            classes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record(&self, class: &str, payload: Value) {
        self.record_at(class, payload, Utc::now());
    }

    pub fn record_at(&self, class: &str, payload: Value, ts: DateTime<Utc>) {
        let mut classes = lock(&self.classes);
        let window = classes.entry(class.to_string()).or_default();
        window.push_back(Envelope {
            topic: class.to_string(),
            ts,
            payload,
        });
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    pub fn latest(&self, class: &str) -> Option<Envelope> {
        lock(&self.classes)
            .get(class)
            .and_then(|window| window.back().cloned())
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, class: &str, limit: usize) -> Vec<Envelope> {
        let classes = lock(&self.classes);
        let Some(window) = classes.get(class) else {
            return Vec::new();
        };
        let skip = window.len().saturating_sub(limit);
        window.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self, class: &str) -> ScalarStats {
        let classes = lock(&self.classes);
        let Some(window) = classes.get(class) else {
            return ScalarStats {
                count: 0,
                average: None,
                min: None,
                max: None,
                latest: None,
            };
        };

        let values: Vec<f64> = window
            .iter()
            .filter_map(|e| scalar_value(&e.payload))
            .collect();
        let (average, min, max) = if values.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = values.iter().sum();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (Some(round2(sum / values.len() as f64)), Some(min), Some(max))
        };
        ScalarStats {
            count: window.len(),
            average,
            min,
            max,
            latest: window.back().cloned(),
        }
    }
}

impl Default for LatestCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Pulls a representative number out of a cached payload: a bare number, or
/// the first of the well-known value fields on an object.
fn scalar_value(payload: &Value) -> Option<f64> {
    if let Some(n) = payload.as_f64() {
        return Some(n);
    }
    let obj = payload.as_object()?;
    for key in ["value", "temp", "temperature", "humedad", "humidity", "co2"] {
        if let Some(n) = obj.get(key).and_then(Value::as_f64) {
            return Some(n);
        }
    }
    None
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn window_is_bounded_and_drops_oldest() {
        let cache = LatestCache::new(3);
        for i in 0..5 {
            cache.record("temperature", json!({ "value": i }));
        }
        let recent = cache.recent("temperature", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload["value"], json!(2));
        assert_eq!(cache.latest("temperature").unwrap().payload["value"], json!(4));
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let cache = LatestCache::new(10);
        for i in 0..4 {
            cache.record("co2", json!(400 + i));
        }
        let recent = cache.recent("co2", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, json!(402));
        assert_eq!(recent[1].payload, json!(403));
    }

    #[test]
    fn stats_over_mixed_payloads() {
        let cache = LatestCache::new(10);
        cache.record("temperature", json!({"value": 20.0, "source": "text"}));
        cache.record("temperature", json!(22.5));
        cache.record("temperature", json!("not a number"));

        let stats = cache.stats("temperature");
        assert_eq!(stats.count, 3);
        assert_eq!(stats.average, Some(21.25));
        assert_eq!(stats.min, Some(20.0));
        assert_eq!(stats.max, Some(22.5));
        assert_eq!(stats.latest.unwrap().payload, json!("not a number"));
    }

    #[test]
    fn empty_class_yields_zero_state() {
        let cache = LatestCache::default();
        let stats = cache.stats("nothing-here");
        assert_eq!(stats.count, 0);
        assert!(stats.average.is_none());
        assert!(cache.latest("nothing-here").is_none());
        assert!(cache.recent("nothing-here", 5).is_empty());
    }

    #[test]
    fn classes_do_not_mix() {
        let cache = LatestCache::default();
        cache.record("temperature", json!(21.0));
        cache.record("co2", json!(700));
        assert_eq!(cache.recent("temperature", 10).len(), 1);
        assert_eq!(cache.recent("co2", 10).len(), 1);
        assert_eq!(cache.latest("co2").unwrap().payload, json!(700));
    }
}
