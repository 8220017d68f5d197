//! Postgres-backed durable store.
//!
//! Records live in a single flat table, `attack_events`. Location fields are
//! stored as separate columns so retention and recency queries stay on plain
//! indexed columns.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` |
//! | `Database` and anything else | `Backend` |
//! | Row decoding failures | `Corrupt` |

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use attackmap_core::{EnrichmentStatus, EventId, EventRecord, GeoLocation};

use super::r#trait::{DurableStore, RecentQuery, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS attack_events (
    id              UUID PRIMARY KEY,
    source          TEXT NOT NULL,
    category        TEXT NOT NULL,
    origin_country  TEXT NOT NULL,
    origin_lat      DOUBLE PRECISION NOT NULL,
    origin_lon      DOUBLE PRECISION NOT NULL,
    origin_network  TEXT,
    target_country  TEXT NOT NULL,
    target_lat      DOUBLE PRECISION NOT NULL,
    target_lon      DOUBLE PRECISION NOT NULL,
    target_network  TEXT,
    observed_at     TIMESTAMPTZ NOT NULL,
    protocol        TEXT NOT NULL,
    magnitude       DOUBLE PRECISION NOT NULL,
    enrichment      TEXT NOT NULL DEFAULT 'pending',
    confidence      DOUBLE PRECISION,
    created_at      TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS attack_events_created_at_idx ON attack_events (created_at DESC)";

const SELECT_COLUMNS: &str = "id, source, category, \
    origin_country, origin_lat, origin_lon, origin_network, \
    target_country, target_lat, target_lon, target_network, \
    observed_at, protocol, magnitude, enrichment, confidence, created_at";

/// Postgres-backed durable store.
///
/// `Clone` is cheap: the pool is reference counted internally.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(CREATE_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DurableStore for PostgresEventStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, records), fields(batch = records.len()), err)]
    async fn insert_batch(&self, records: &[EventRecord]) -> Result<Vec<EventId>, StoreError> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut seen = HashSet::with_capacity(records.len());
        let mut written = Vec::with_capacity(records.len());

        for record in records {
            if !seen.insert(record.id) {
                continue;
            }

            let result = sqlx::query(
                r#"
                INSERT INTO attack_events (
                    id, source, category,
                    origin_country, origin_lat, origin_lon, origin_network,
                    target_country, target_lat, target_lon, target_network,
                    observed_at, protocol, magnitude, enrichment, confidence, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.source)
            .bind(&record.category)
            .bind(&record.origin.country_code)
            .bind(record.origin.latitude)
            .bind(record.origin.longitude)
            .bind(record.origin.network.as_deref())
            .bind(&record.target.country_code)
            .bind(record.target.latitude)
            .bind(record.target.longitude)
            .bind(record.target.network.as_deref())
            .bind(record.observed_at)
            .bind(&record.protocol)
            .bind(record.magnitude)
            .bind(record.enrichment.as_str())
            .bind(record.confidence)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            if result.rows_affected() == 1 {
                written.push(record.id);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(written)
    }

    #[instrument(skip(self), err)]
    async fn update_enrichment(
        &self,
        id: EventId,
        status: EnrichmentStatus,
        confidence: Option<f64>,
    ) -> Result<Option<EventRecord>, StoreError> {
        let sql = format!(
            "UPDATE attack_events SET enrichment = $2, confidence = $3 WHERE id = $1 RETURNING {SELECT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(status.as_str())
            .bind(confidence)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_enrichment", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM attack_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_older_than", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn recent(&self, query: &RecentQuery) -> Result<Vec<EventRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM attack_events \
             WHERE ($1::timestamptz IS NULL OR created_at >= $1) \
               AND ($2::text IS NULL OR enrichment = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(query.since)
            .bind(query.status.map(|s| s.as_str()))
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("recent", e))?;

        rows.iter().map(decode_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let row = EventRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize event row: {e}")))?;
    EventRecord::try_from(row)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            StoreError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug, Clone, PartialEq)]
struct EventRow {
    id: uuid::Uuid,
    source: String,
    category: String,
    origin_country: String,
    origin_lat: f64,
    origin_lon: f64,
    origin_network: Option<String>,
    target_country: String,
    target_lat: f64,
    target_lon: f64,
    target_network: Option<String>,
    observed_at: DateTime<Utc>,
    protocol: String,
    magnitude: f64,
    enrichment: String,
    confidence: Option<f64>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            category: row.try_get("category")?,
            origin_country: row.try_get("origin_country")?,
            origin_lat: row.try_get("origin_lat")?,
            origin_lon: row.try_get("origin_lon")?,
            origin_network: row.try_get("origin_network")?,
            target_country: row.try_get("target_country")?,
            target_lat: row.try_get("target_lat")?,
            target_lon: row.try_get("target_lon")?,
            target_network: row.try_get("target_network")?,
            observed_at: row.try_get("observed_at")?,
            protocol: row.try_get("protocol")?,
            magnitude: row.try_get("magnitude")?,
            enrichment: row.try_get("enrichment")?,
            confidence: row.try_get("confidence")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let enrichment: EnrichmentStatus = row
            .enrichment
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("row {}: {e}", row.id)))?;

        Ok(EventRecord {
            id: EventId::from_uuid(row.id),
            source: row.source,
            category: row.category,
            origin: GeoLocation {
                country_code: row.origin_country,
                latitude: row.origin_lat,
                longitude: row.origin_lon,
                network: row.origin_network,
            },
            target: GeoLocation {
                country_code: row.target_country,
                latitude: row.target_lat,
                longitude: row.target_lon,
                network: row.target_network,
            },
            observed_at: row.observed_at,
            protocol: row.protocol,
            magnitude: row.magnitude,
            enrichment,
            confidence: row.confidence,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> EventRow {
        let now = Utc::now();
        EventRow {
            id: uuid::Uuid::now_v7(),
            source: "radar".into(),
            category: "udp_flood".into(),
            origin_country: "CN".into(),
            origin_lat: 39.9,
            origin_lon: 116.4,
            origin_network: Some("203.0.113.7".into()),
            target_country: "US".into(),
            target_lat: 40.7,
            target_lon: -74.0,
            target_network: None,
            observed_at: now,
            protocol: "UDP".into(),
            magnitude: 3.5,
            enrichment: "enriched".into(),
            confidence: Some(0.8),
            created_at: now,
        }
    }

    #[test]
    fn row_maps_to_record() {
        let row = row();
        let id = row.id;
        let record = EventRecord::try_from(row).unwrap();

        assert_eq!(*record.id.as_uuid(), id);
        assert_eq!(record.origin.network.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.target.longitude, -74.0);
        assert_eq!(record.enrichment, EnrichmentStatus::Enriched);
        assert_eq!(record.confidence, Some(0.8));
    }

    #[test]
    fn unknown_enrichment_value_is_corrupt() {
        let mut row = row();
        row.enrichment = "scored".into();
        assert!(matches!(EventRecord::try_from(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("ping", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("recent", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
    }
}
