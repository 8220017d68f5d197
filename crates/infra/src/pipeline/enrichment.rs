use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use attackmap_core::{EnrichmentStatus, EventRecord};
use attackmap_scoring::{ScoreError, Scorer, checked_score};

use crate::jobs::{Job, JobError};
use crate::store::{RecentQuery, SharedEventStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    pub enriched: u64,
    pub skipped: u64,
    /// Deleted by retention between the read and the update.
    pub vanished: u64,
}

/// Scores up to `batch_size` pending records per run.
///
/// A failed, timed-out or out-of-range score marks the record `skipped`;
/// skipped records are never retried.
pub struct EnrichmentJob {
    store: SharedEventStore,
    scorer: Arc<dyn Scorer>,
    batch_size: usize,
    timeout: Duration,
    enriched: AtomicU64,
    skipped: AtomicU64,
    vanished: AtomicU64,
}

impl EnrichmentJob {
    pub const NAME: &'static str = "enrich_events";

    pub fn new(store: SharedEventStore, scorer: Arc<dyn Scorer>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            store,
            scorer,
            batch_size,
            timeout,
            enriched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            vanished: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> EnrichmentStats {
        EnrichmentStats {
            enriched: self.enriched.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            vanished: self.vanished.load(Ordering::Relaxed),
        }
    }

    async fn score(&self, record: &EventRecord) -> Result<f64, ScoreError> {
        match tokio::time::timeout(self.timeout, self.scorer.score(record)).await {
            Ok(result) => checked_score(result?),
            Err(_) => Err(ScoreError::Unavailable(format!(
                "{} timed out after {:?}",
                self.scorer.name(),
                self.timeout
            ))),
        }
    }

    async fn enrich_one(&self, record: &EventRecord, run: &mut EnrichmentStats) -> Result<(), StoreError> {
        let found = match self.score(record).await {
            Ok(score) => {
                let found = self.store.mark_enriched(record.id, score).await?;
                if found {
                    run.enriched += 1;
                }
                found
            }
            Err(e) => {
                debug!(event_id = %record.id, error = %e, "scoring failed; marking skipped");
                let found = self.store.mark_skipped(record.id).await?;
                if found {
                    run.skipped += 1;
                }
                found
            }
        };
        if !found {
            run.vanished += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EnrichmentJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentJob")
            .field("scorer", &self.scorer.name())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[async_trait]
impl Job for EnrichmentJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), JobError> {
        let pending = self
            .store
            .recent(&RecentQuery::latest(self.batch_size).with_status(EnrichmentStatus::Pending))
            .await?;

        let mut run = EnrichmentStats::default();
        let result = async {
            for record in &pending {
                self.enrich_one(record, &mut run).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        self.enriched.fetch_add(run.enriched, Ordering::Relaxed);
        self.skipped.fetch_add(run.skipped, Ordering::Relaxed);
        self.vanished.fetch_add(run.vanished, Ordering::Relaxed);

        info!(
            scorer = %self.scorer.name(),
            pending = pending.len(),
            enriched = run.enriched,
            skipped = run.skipped,
            vanished = run.vanished,
            "enrichment cycle complete"
        );
        result.map_err(JobError::from)
    }
}
