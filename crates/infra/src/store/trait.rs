use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use attackmap_core::{CoreError, EnrichmentStatus, EventId, EventRecord};

/// Backend operation error.
///
/// Both backends report through this type; the caller decides whether a
/// failure is fatal (durable store) or only logged (cache).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable (connection refused, pool closed, timeout).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend reachable but the operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded into a record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(msg) => CoreError::data_integrity(msg),
            other => CoreError::transient(other.to_string()),
        }
    }
}

/// Filter for [`DurableStore::recent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentQuery {
    pub limit: usize,
    /// Only records created at or after this instant.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<EnrichmentStatus>,
}

impl RecentQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            since: None,
            status: None,
        }
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_status(mut self, status: EnrichmentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        self.since.is_none_or(|since| record.created_at >= since)
            && self.status.is_none_or(|status| record.enrichment == status)
    }
}

/// Authoritative record storage.
///
/// Implementations must:
/// - never overwrite an existing id on insert
/// - return records most-recent-first from [`DurableStore::recent`]
/// - treat `created_at < cutoff` as "older than" for retention
#[async_trait]
pub trait DurableStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Insert records whose ids are not present yet. Returns the ids that were
    /// actually written, in batch order.
    async fn insert_batch(&self, records: &[EventRecord]) -> Result<Vec<EventId>, StoreError>;

    /// Set enrichment fields. `Ok(None)` when the id is unknown.
    async fn update_enrichment(
        &self,
        id: EventId,
        status: EnrichmentStatus,
        confidence: Option<f64>,
    ) -> Result<Option<EventRecord>, StoreError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn recent(&self, query: &RecentQuery) -> Result<Vec<EventRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bounded cache of the most recent records.
#[async_trait]
pub trait VolatileCache: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Most records held at once.
    fn capacity(&self) -> usize;

    /// Add records, evicting the oldest beyond capacity.
    async fn put(&self, records: &[EventRecord]) -> Result<(), StoreError>;

    /// Replace a cached record; records no longer cached are ignored.
    async fn update(&self, record: &EventRecord) -> Result<(), StoreError>;

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Drop every cached record.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Most-recent-first, at most `limit`.
    async fn recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
