use crate::errors::{Error, Result};
use crate::model::{AggregateStats, DeviceRecord, SensorReading};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer created the row between lookup and insert.
    DuplicateKey,
}

/// Keyed storage for device records and their reading history. The trait is
/// the seam to the relational collaborator; the sync path runs against an
/// in-memory implementation in tests.
#[async_trait]
pub trait DeviceStore: Clone + Send + Sync + 'static {
    async fn fetch(&self, device_id: &str) -> Result<Option<DeviceRecord>>;
    async fn insert(&self, record: &DeviceRecord) -> Result<InsertOutcome>;
    async fn update(&self, record: &DeviceRecord) -> Result<()>;
    async fn list(&self) -> Result<Vec<DeviceRecord>>;
    async fn insert_reading(&self, reading: &SensorReading) -> Result<()>;
    async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<SensorReading>>;
    async fn reading_stats(&self, device_id: &str) -> Result<AggregateStats>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgStore {
    pub async fn connect(database_url: &str, statement_timeout: Duration) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::StoreUnavailable(sqlx::Error::Migrate(Box::new(e))))?;
        info!("Migrations completed");

        Ok(Self {
            pool,
            statement_timeout,
        })
    }
}

/// Every relational query runs under this hard deadline. A statement that
/// outlives it reports the store as unavailable instead of stalling the
/// caller.
async fn with_deadline<T>(
    deadline: Duration,
    query: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, query).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreUnavailable(sqlx::Error::PoolTimedOut)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| code == "23505") // unique_violation
        }
        _ => false,
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn fetch(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        with_deadline(self.statement_timeout, async {
            let record = sqlx::query_as::<_, DeviceRecord>(
                r#"
                SELECT device_id, name, kind, location, status,
                       parent_gateway_id, parent_endpoint_id, metadata,
                       last_seen_at, created_at, updated_at
                FROM devices
                WHERE device_id = $1
                "#,
            )
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(record)
        })
        .await
    }

    async fn insert(&self, record: &DeviceRecord) -> Result<InsertOutcome> {
        with_deadline(self.statement_timeout, async {
            let result = sqlx::query(
                r#"
                INSERT INTO devices
                    (device_id, name, kind, location, status,
                     parent_gateway_id, parent_endpoint_id, metadata,
                     last_seen_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(&record.device_id)
            .bind(&record.name)
            .bind(record.kind)
            .bind(&record.location)
            .bind(record.status)
            .bind(&record.parent_gateway_id)
            .bind(&record.parent_endpoint_id)
            .bind(&record.metadata)
            .bind(record.last_seen_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(InsertOutcome::Inserted),
                Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::DuplicateKey),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, record: &DeviceRecord) -> Result<()> {
        with_deadline(self.statement_timeout, async {
            sqlx::query(
                r#"
                UPDATE devices
                SET name = $2, location = $3, status = $4,
                    parent_gateway_id = $5, parent_endpoint_id = $6,
                    metadata = $7, last_seen_at = $8, updated_at = $9
                WHERE device_id = $1
                "#,
            )
            .bind(&record.device_id)
            .bind(&record.name)
            .bind(&record.location)
            .bind(record.status)
            .bind(&record.parent_gateway_id)
            .bind(&record.parent_endpoint_id)
            .bind(&record.metadata)
            .bind(record.last_seen_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>> {
        with_deadline(self.statement_timeout, async {
            let records = sqlx::query_as::<_, DeviceRecord>(
                r#"
                SELECT device_id, name, kind, location, status,
                       parent_gateway_id, parent_endpoint_id, metadata,
                       last_seen_at, created_at, updated_at
                FROM devices
                ORDER BY name ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(records)
        })
        .await
    }

    async fn insert_reading(&self, reading: &SensorReading) -> Result<()> {
        with_deadline(self.statement_timeout, async {
            sqlx::query(
                r#"
                INSERT INTO sensor_readings
                    (device_id, sensor_type, value, unit, timestamp, metadata)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&reading.device_id)
            .bind(&reading.sensor_type)
            .bind(reading.value)
            .bind(&reading.unit)
            .bind(reading.timestamp)
            .bind(&reading.metadata)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<SensorReading>> {
        with_deadline(self.statement_timeout, async {
            let readings = sqlx::query_as::<_, SensorReading>(
                r#"
                SELECT device_id, sensor_type, value, unit, timestamp, metadata
                FROM sensor_readings
                WHERE device_id = $1
                ORDER BY timestamp DESC
                LIMIT $2
                "#,
            )
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(readings)
        })
        .await
    }

    async fn reading_stats(&self, device_id: &str) -> Result<AggregateStats> {
        with_deadline(self.statement_timeout, async {
            let stats = sqlx::query_as::<_, AggregateStats>(
                r#"
                SELECT COUNT(*) AS total_readings,
                       MIN(timestamp) AS first_reading_at,
                       MAX(timestamp) AS last_reading_at,
                       COUNT(DISTINCT sensor_type) AS distinct_sensor_types,
                       AVG(value) AS average_value
                FROM sensor_readings
                WHERE device_id = $1
                "#,
            )
            .bind(device_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalled_query_reports_store_unavailable() {
        tokio_test::block_on(async {
            let result: Result<()> =
                with_deadline(Duration::from_millis(20), std::future::pending()).await;
            assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        });
    }

    #[test]
    fn query_within_deadline_passes_through() {
        tokio_test::block_on(async {
            let result = with_deadline(Duration::from_secs(5), async { Ok(7) }).await;
            assert_eq!(result.unwrap(), 7);
        });
    }
}
