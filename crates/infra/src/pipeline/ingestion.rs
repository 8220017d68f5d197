use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use attackmap_core::{EventRecord, RawObservation};

use crate::jobs::{Job, JobError};
use crate::producers::{Producer, ProducerError};
use crate::store::SharedEventStore;

impl From<ProducerError> for JobError {
    fn from(err: ProducerError) -> Self {
        match err {
            ProducerError::Malformed(msg) => JobError::Failed(format!("malformed batch: {msg}")),
            other => JobError::Transient(other.to_string()),
        }
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub fetched: u64,
    pub written: u64,
    pub malformed: u64,
}

/// Pulls one batch per run from a producer and appends it to the store.
pub struct IngestionJob {
    producer: Arc<dyn Producer>,
    store: SharedEventStore,
    timeout: Duration,
    cursor: Mutex<Option<DateTime<Utc>>>,
    last_created: Mutex<Option<DateTime<Utc>>>,
    fetched: AtomicU64,
    written: AtomicU64,
    malformed: AtomicU64,
}

impl IngestionJob {
    pub const NAME: &'static str = "fetch_radar_data";

    pub fn new(producer: Arc<dyn Producer>, store: SharedEventStore, timeout: Duration) -> Self {
        Self {
            producer,
            store,
            timeout,
            cursor: Mutex::new(None),
            last_created: Mutex::new(None),
            fetched: AtomicU64::new(0),
            written: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> IngestionStats {
        IngestionStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// End of the last window that was stored successfully.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor.lock().ok().and_then(|c| *c)
    }

    /// Validate observations; returns the records and the number dropped.
    fn map_batch(&self, observations: Vec<serde_json::Value>) -> (Vec<EventRecord>, u64) {
        let source = self.producer.name();
        let mut created = self
            .last_created
            .lock()
            .ok()
            .and_then(|c| *c)
            .map_or_else(Utc::now, |last| last.max(Utc::now()));

        let mut records = Vec::with_capacity(observations.len());
        let mut dropped = 0;

        for value in observations {
            let mapped = serde_json::from_value::<RawObservation>(value)
                .map_err(|e| e.to_string())
                .and_then(|raw| raw.into_record(source, created).map_err(|e| e.to_string()));

            match mapped {
                Ok(record) => records.push(record),
                Err(reason) => {
                    dropped += 1;
                    debug!(producer = %source, reason = %reason, "dropping observation");
                }
            }
            created = created.max(Utc::now());
        }

        if let Ok(mut last) = self.last_created.lock() {
            *last = Some(created);
        }
        (records, dropped)
    }
}

impl std::fmt::Debug for IngestionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionJob")
            .field("producer", &self.producer.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Job for IngestionJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), JobError> {
        let since = self.cursor();

        let batch = tokio::time::timeout(self.timeout, self.producer.fetch(since))
            .await
            .map_err(|_| ProducerError::Timeout)??;

        let fetched = batch.observations.len() as u64;
        let (records, malformed) = self.map_batch(batch.observations);
        if malformed > 0 {
            warn!(producer = %self.producer.name(), malformed, fetched, "dropped malformed observations");
        }

        let written = self.store.append(records).await?;

        if let Ok(mut cursor) = self.cursor.lock() {
            *cursor = Some(batch.window_end);
        }
        self.fetched.fetch_add(fetched, Ordering::Relaxed);
        self.written.fetch_add(written as u64, Ordering::Relaxed);
        self.malformed.fetch_add(malformed, Ordering::Relaxed);

        info!(producer = %self.producer.name(), fetched, written, malformed, "ingestion cycle complete");
        Ok(())
    }
}
