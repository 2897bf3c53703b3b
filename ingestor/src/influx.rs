use crate::errors::Result;
use crate::history::{HistoryQuery, RawPoint, TimeSeriesSource};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for an InfluxDB 1.x `/query` endpoint. Requests carry a hard
/// deadline; hitting it maps to `QueryTimeout` so callers can retry with a
/// smaller window.
#[derive(Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    base_url: String,
    database: String,
    measurement: String,
}

impl InfluxClient {
    pub fn new(
        base_url: &str,
        database: &str,
        measurement: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.to_string(),
            measurement: measurement.to_string(),
        })
    }

    fn build_query(&self, query: &HistoryQuery) -> String {
        let mut clauses = vec![format!("time > now() - {}s", query.window.as_secs())];
        if let Some(device_id) = query.device_id.as_deref() {
            // Device ids end up in the host or topic tag depending on which
            // collector wrote the point; match either, with the id stripped
            // down to characters that are safe inside a regex literal.
            let needle = sanitize_identifier(device_id);
            if !needle.is_empty() {
                clauses.push(format!(
                    "(\"host\" =~ /{needle}/ OR \"topic\" =~ /{needle}/)"
                ));
            }
        }
        format!(
            "SELECT * FROM \"{}\" WHERE {} ORDER BY time DESC LIMIT {}",
            self.measurement,
            clauses.join(" AND "),
            query.limit
        )
    }
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[derive(Deserialize)]
struct InfluxResponse {
    #[serde(default)]
    results: Vec<InfluxResult>,
}

#[derive(Deserialize)]
struct InfluxResult {
    #[serde(default)]
    series: Vec<InfluxSeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct InfluxSeries {
    columns: Vec<String>,
    values: Vec<Vec<Value>>,
}

#[async_trait]
impl TimeSeriesSource for InfluxClient {
    async fn query_points(&self, query: &HistoryQuery) -> Result<Vec<RawPoint>> {
        let statement = self.build_query(query);
        debug!(query = %statement, "querying time-series store");

        let url = format!("{}/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("db", self.database.as_str()),
                ("epoch", "ms"),
                ("q", statement.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: InfluxResponse = response.json().await?;

        let mut points = Vec::new();
        for result in body.results {
            if let Some(error) = result.error {
                warn!(error = %error, "time-series statement rejected");
                continue;
            }
            for series in result.series {
                let InfluxSeries { columns, values } = series;
                for row in values {
                    let mut time = None;
                    let mut fields = Map::new();
                    for (column, value) in columns.iter().zip(row) {
                        if column == "time" {
                            time = value
                                .as_i64()
                                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                        } else {
                            fields.insert(column.clone(), value);
                        }
                    }
                    if let Some(time) = time {
                        points.push(RawPoint { time, fields });
                    }
                }
            }
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> InfluxClient {
        InfluxClient::new(
            "http://localhost:8086/",
            "iot",
            "mqtt_consumer",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn query_carries_window_limit_and_order() {
        let q = HistoryQuery::new(None, Some(25), Some(Duration::from_secs(3600)));
        let statement = client().build_query(&q);
        assert_eq!(
            statement,
            "SELECT * FROM \"mqtt_consumer\" WHERE time > now() - 3600s \
             ORDER BY time DESC LIMIT 25"
        );
    }

    #[test]
    fn device_filter_matches_host_or_topic() {
        let q = HistoryQuery::new(Some("ep-1".to_string()), Some(10), None);
        let statement = client().build_query(&q);
        assert!(statement.contains("(\"host\" =~ /ep-1/ OR \"topic\" =~ /ep-1/)"));
    }

    #[test]
    fn device_id_is_sanitized_before_interpolation() {
        let q = HistoryQuery::new(Some("ep/1; DROP".to_string()), Some(10), None);
        let statement = client().build_query(&q);
        assert!(statement.contains("/ep1DROP/"));
        assert!(!statement.contains(';'));
    }

    #[test]
    fn fully_hostile_device_id_adds_no_filter() {
        let q = HistoryQuery::new(Some("/.*/ ;".to_string()), Some(10), None);
        let statement = client().build_query(&q);
        assert!(!statement.contains("=~"));
    }
}
