use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::jobs::{Job, JobError};
use crate::store::SharedEventStore;

/// Deletes records created before `now - window`.
#[derive(Debug)]
pub struct RetentionJob {
    store: SharedEventStore,
    window: chrono::Duration,
}

impl RetentionJob {
    pub const NAME: &'static str = "cleanup_events";

    pub fn new(store: SharedEventStore, window: Duration) -> Self {
        Self {
            store,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl Job for RetentionJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), JobError> {
        let cutoff = self.cutoff(Utc::now());
        let deleted = self.store.delete_older_than(cutoff).await?;
        info!(deleted, cutoff = %cutoff, "retention cycle complete");
        Ok(())
    }
}
