use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use attackmap_core::{EnrichmentStatus, EventId, EventRecord};

use super::r#trait::{DurableStore, RecentQuery, StoreError, VolatileCache};

/// Position of a record in time order. Ties on `created_at` are broken by
/// id, the same order the Postgres store uses.
type TimeKey = (DateTime<Utc>, EventId);

#[derive(Debug, Default)]
struct Timeline {
    by_time: BTreeMap<TimeKey, EventRecord>,
    index: HashMap<EventId, TimeKey>,
}

impl Timeline {
    fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    fn insert(&mut self, record: EventRecord) {
        if let Some(old) = self.index.remove(&record.id) {
            self.by_time.remove(&old);
        }
        let key = (record.created_at, record.id);
        self.index.insert(record.id, key);
        self.by_time.insert(key, record);
    }

    fn get_mut(&mut self, id: &EventId) -> Option<&mut EventRecord> {
        let key = self.index.get(id)?;
        self.by_time.get_mut(key)
    }

    fn remove_older_than(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let keep = self.by_time.split_off(&(cutoff, EventId::from_uuid(Uuid::nil())));
        let removed = std::mem::replace(&mut self.by_time, keep);
        for record in removed.values() {
            self.index.remove(&record.id);
        }
        removed.len() as u64
    }

    fn evict_oldest(&mut self, max: usize) {
        while self.by_time.len() > max {
            match self.by_time.pop_first() {
                Some((_, record)) => {
                    self.index.remove(&record.id);
                }
                None => break,
            }
        }
    }

    fn newest_first<'a>(&'a self) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.by_time.values().rev()
    }

    fn len(&self) -> usize {
        self.by_time.len()
    }
}

fn outage(backend: &str) -> StoreError {
    StoreError::Unavailable(format!("{backend} marked unavailable"))
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory durable store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug)]
pub struct InMemoryDurableStore {
    timeline: RwLock<Timeline>,
    available: AtomicBool,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self {
            timeline: RwLock::new(Timeline::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.timeline.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(outage("memory store"))
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_batch(&self, records: &[EventRecord]) -> Result<Vec<EventId>, StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;

        let mut written = Vec::new();
        for record in records {
            if timeline.contains(&record.id) {
                continue;
            }
            timeline.insert(record.clone());
            written.push(record.id);
        }
        Ok(written)
    }

    async fn update_enrichment(
        &self,
        id: EventId,
        status: EnrichmentStatus,
        confidence: Option<f64>,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;

        Ok(timeline.get_mut(&id).map(|record| {
            record.enrichment = status;
            record.confidence = confidence;
            record.clone()
        }))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;
        Ok(timeline.remove_older_than(cutoff))
    }

    async fn recent(&self, query: &RecentQuery) -> Result<Vec<EventRecord>, StoreError> {
        self.check()?;
        let timeline = self.timeline.read().map_err(|_| poisoned())?;

        Ok(timeline
            .newest_first()
            .filter(|r| query.matches(r))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// In-memory bounded cache.
#[derive(Debug)]
pub struct InMemoryCache {
    timeline: RwLock<Timeline>,
    max_records: usize,
    available: AtomicBool,
}

impl InMemoryCache {
    pub fn new(max_records: usize) -> Self {
        Self {
            timeline: RwLock::new(Timeline::default()),
            max_records,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.timeline.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(outage("memory cache"))
        }
    }
}

#[async_trait]
impl VolatileCache for InMemoryCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn capacity(&self) -> usize {
        self.max_records
    }

    async fn put(&self, records: &[EventRecord]) -> Result<(), StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;

        let mut seen = HashSet::new();
        for record in records {
            if seen.insert(record.id) {
                timeline.insert(record.clone());
            }
        }
        timeline.evict_oldest(self.max_records);
        Ok(())
    }

    async fn update(&self, record: &EventRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;

        if let Some(cached) = timeline.get_mut(&record.id) {
            *cached = record.clone();
        }
        Ok(())
    }

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;
        Ok(timeline.remove_older_than(cutoff))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        let mut timeline = self.timeline.write().map_err(|_| poisoned())?;
        *timeline = Timeline::default();
        Ok(())
    }

    async fn recent(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.check()?;
        let timeline = self.timeline.read().map_err(|_| poisoned())?;

        Ok(timeline
            .newest_first()
            .filter(|r| since.is_none_or(|s| r.created_at >= s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use attackmap_core::GeoLocation;
    use chrono::Duration;

    pub(crate) fn record_at(created_at: DateTime<Utc>) -> EventRecord {
        let loc = GeoLocation {
            country_code: "US".into(),
            latitude: 10.0,
            longitude: 20.0,
            network: None,
        };
        EventRecord {
            id: EventId::new(),
            source: "synthetic".into(),
            category: "syn_flood".into(),
            origin: loc.clone(),
            target: loc,
            observed_at: created_at,
            protocol: "TCP".into(),
            magnitude: 5.0,
            enrichment: EnrichmentStatus::Pending,
            confidence: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn insert_skips_existing_and_repeated_ids() {
        let store = InMemoryDurableStore::new();
        let a = record_at(Utc::now());
        let b = record_at(Utc::now());

        let written = store.insert_batch(&[a.clone(), b.clone(), a.clone()]).await.unwrap();
        assert_eq!(written, vec![a.id, b.id]);

        let written = store.insert_batch(&[a.clone()]).await.unwrap();
        assert!(written.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_filtered() {
        let store = InMemoryDurableStore::new();
        let t0 = Utc::now();
        let records: Vec<_> = (0..5).map(|i| record_at(t0 + Duration::seconds(i))).collect();
        store.insert_batch(&records).await.unwrap();
        store
            .update_enrichment(records[4].id, EnrichmentStatus::Enriched, Some(0.9))
            .await
            .unwrap();

        let latest = store.recent(&RecentQuery::latest(2)).await.unwrap();
        assert_eq!(latest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![records[4].id, records[3].id]);

        let pending = store
            .recent(&RecentQuery::latest(10).with_status(EnrichmentStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 4);

        let since = store
            .recent(&RecentQuery::latest(10).with_since(t0 + Duration::seconds(3)))
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_none() {
        let store = InMemoryDurableStore::new();
        let updated = store
            .update_enrichment(EventId::new(), EnrichmentStatus::Skipped, None)
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn delete_is_strictly_older_than_cutoff() {
        let store = InMemoryDurableStore::new();
        let t0 = Utc::now();
        let old = record_at(t0 - Duration::seconds(10));
        let edge = record_at(t0);
        store.insert_batch(&[old, edge.clone()]).await.unwrap();

        assert_eq!(store.delete_older_than(t0).await.unwrap(), 1);
        let left = store.recent(&RecentQuery::latest(10)).await.unwrap();
        assert_eq!(left, vec![edge]);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_beyond_capacity() {
        let cache = InMemoryCache::new(3);
        let t0 = Utc::now();
        let records: Vec<_> = (0..5).map(|i| record_at(t0 + Duration::seconds(i))).collect();
        cache.put(&records).await.unwrap();

        let cached = cache.recent(10, None).await.unwrap();
        assert_eq!(
            cached.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![records[4].id, records[3].id, records[2].id]
        );
    }

    #[tokio::test]
    async fn cache_update_ignores_evicted_records() {
        let cache = InMemoryCache::new(1);
        let mut a = record_at(Utc::now());
        let b = record_at(Utc::now() + Duration::seconds(1));
        cache.put(&[a.clone(), b]).await.unwrap();

        a.enrich(0.5);
        cache.update(&a).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.recent(10, None).await.unwrap().iter().all(|r| r.id != a.id));
    }

    #[tokio::test]
    async fn equal_timestamps_are_ordered_by_id_descending() {
        let store = InMemoryDurableStore::new();
        let cache = InMemoryCache::new(10);
        let at = Utc::now();
        let records: Vec<_> = (0..6).map(|_| record_at(at)).collect();
        store.insert_batch(&records).await.unwrap();
        cache.put(&records).await.unwrap();

        let mut expected: Vec<EventId> = records.iter().map(|r| r.id).collect();
        expected.sort();
        expected.reverse();

        let durable: Vec<_> = store.recent(&RecentQuery::latest(10)).await.unwrap().iter().map(|r| r.id).collect();
        let cached: Vec<_> = cache.recent(10, None).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(durable, expected);
        assert_eq!(cached, expected);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = InMemoryCache::new(10);
        cache.put(&[record_at(Utc::now()), record_at(Utc::now())]).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 10);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_operation() {
        let cache = InMemoryCache::new(10);
        cache.set_available(false);
        assert!(matches!(cache.ping().await, Err(StoreError::Unavailable(_))));
        assert!(cache.put(&[record_at(Utc::now())]).await.is_err());

        cache.set_available(true);
        assert!(cache.ping().await.is_ok());
    }
}
