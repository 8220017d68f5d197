use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use attackmap_core::{EnrichmentStatus, EventId, EventRecord};
use attackmap_events::EventPublisher;

use super::r#trait::{DurableStore, RecentQuery, StoreError, VolatileCache};

/// Whether the cache may disagree with the durable store.
///
/// A failed cache write marks the cache suspect. The next unfiltered read is
/// then served from the durable store and rebuilds the cache from it. A
/// rebuild that overlapped an update or a delete cannot be trusted and leaves
/// the cache suspect.
#[derive(Debug, Default)]
struct CacheState {
    suspect: AtomicBool,
    mutations: AtomicU64,
    in_flight: AtomicUsize,
}

impl CacheState {
    fn begin_mutation(&self) -> MutationGuard<'_> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        MutationGuard(self)
    }
}

struct MutationGuard<'a>(&'a CacheState);

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Coordinates the durable store, the cache and the record publisher.
///
/// Ordering invariant: a record is published only after the durable write
/// that created it succeeded. The cache is best-effort; its failures are
/// logged and never surface to callers, and the cache is rebuilt from the
/// durable store on the next read.
#[derive(Clone)]
pub struct SharedEventStore {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn VolatileCache>,
    publisher: Arc<dyn EventPublisher<EventRecord>>,
    cache_state: Arc<CacheState>,
}

impl std::fmt::Debug for SharedEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEventStore")
            .field("durable", &self.durable.backend())
            .field("cache", &self.cache.backend())
            .finish()
    }
}

impl SharedEventStore {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn VolatileCache>,
        publisher: Arc<dyn EventPublisher<EventRecord>>,
    ) -> Self {
        Self {
            durable,
            cache,
            publisher,
            cache_state: Arc::new(CacheState::default()),
        }
    }

    /// Write new records; returns how many were actually written.
    ///
    /// Ids already stored, and repeats inside `batch`, are skipped.
    pub async fn append(&self, batch: Vec<EventRecord>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let written = self.durable.insert_batch(&batch).await?;
        if written.is_empty() {
            return Ok(0);
        }

        let mut pending: HashSet<EventId> = written.iter().copied().collect();
        let records: Vec<EventRecord> = batch
            .into_iter()
            .filter(|r| pending.remove(&r.id))
            .collect();

        if let Err(e) = self.cache.put(&records).await {
            self.cache_failed("put", &e);
        }

        let count = records.len();
        for record in records {
            let id = record.id;
            if let Err(e) = self.publisher.publish(record) {
                warn!(error = %e, event_id = %id, "publish failed");
            }
        }

        debug!(written = count, "records appended");
        Ok(count)
    }

    /// Record a successful score. `false` when the record no longer exists.
    pub async fn mark_enriched(&self, id: EventId, score: f64) -> Result<bool, StoreError> {
        self.set_enrichment(id, EnrichmentStatus::Enriched, Some(score))
            .await
    }

    /// Record a scoring failure. `false` when the record no longer exists.
    pub async fn mark_skipped(&self, id: EventId) -> Result<bool, StoreError> {
        self.set_enrichment(id, EnrichmentStatus::Skipped, None).await
    }

    async fn set_enrichment(
        &self,
        id: EventId,
        status: EnrichmentStatus,
        confidence: Option<f64>,
    ) -> Result<bool, StoreError> {
        let _mutation = self.cache_state.begin_mutation();
        let Some(updated) = self
            .durable
            .update_enrichment(id, status, confidence)
            .await?
        else {
            debug!(event_id = %id, "record gone before enrichment update");
            return Ok(false);
        };

        if let Err(e) = self.cache.update(&updated).await {
            self.cache_failed("update", &e);
        }
        Ok(true)
    }

    /// Delete records created before `cutoff` from both backends.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let _mutation = self.cache_state.begin_mutation();
        let (durable, cache) = tokio::join!(
            self.durable.delete_older_than(cutoff),
            self.cache.remove_older_than(cutoff)
        );

        if let Err(e) = cache {
            self.cache_failed("remove_older_than", &e);
        }
        durable
    }

    /// Most recent records first, at most `query.limit`.
    ///
    /// Served from the cache when it can answer fully; otherwise from the
    /// durable store. A suspect cache is rebuilt first and not read.
    pub async fn recent(&self, query: &RecentQuery) -> Result<Vec<EventRecord>, StoreError> {
        if query.limit == 0 {
            return Ok(vec![]);
        }

        if query.status.is_none() {
            if self.cache_state.suspect.swap(false, Ordering::SeqCst) {
                self.rebuild_cache().await;
            } else {
                match self.cache.recent(query.limit, query.since).await {
                    Ok(records) if records.len() >= query.limit => return Ok(records),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, backend = self.cache.backend(), "cache read failed");
                    }
                }
            }
        }

        self.durable.recent(query).await
    }

    /// Reload the cache with the newest durable records.
    ///
    /// Cleared before the snapshot is read, so a concurrent append lands
    /// either in the snapshot or in the rebuilt cache.
    async fn rebuild_cache(&self) {
        let state = &self.cache_state;
        let before = state.mutations.load(Ordering::SeqCst);
        let quiet = state.in_flight.load(Ordering::SeqCst) == 0;

        let rebuilt = async {
            self.cache.clear().await?;
            let snapshot = self
                .durable
                .recent(&RecentQuery::latest(self.cache.capacity()))
                .await?;
            self.cache.put(&snapshot).await?;
            Ok::<_, StoreError>(snapshot.len())
        }
        .await;

        match rebuilt {
            Ok(records) if quiet && state.mutations.load(Ordering::SeqCst) == before => {
                info!(records, backend = self.cache.backend(), "cache rebuilt from durable store");
            }
            Ok(_) => {
                debug!("cache mutated during rebuild");
                state.suspect.store(true, Ordering::SeqCst);
            }
            Err(e) => self.cache_failed("rebuild", &e),
        }
    }

    fn cache_failed(&self, operation: &str, err: &StoreError) {
        warn!(error = %err, backend = self.cache.backend(), operation, "cache write failed; cache marked for rebuild");
        self.cache_state.suspect.store(true, Ordering::SeqCst);
    }

    pub async fn ping_durable(&self) -> Result<(), StoreError> {
        self.durable.ping().await
    }

    pub async fn ping_cache(&self) -> Result<(), StoreError> {
        self.cache.ping().await
    }

    pub fn durable_backend(&self) -> &'static str {
        self.durable.backend()
    }

    pub fn cache_backend(&self) -> &'static str {
        self.cache.backend()
    }
}
