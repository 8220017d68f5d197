//! Core job types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use attackmap_core::CoreError;

use crate::store::StoreError;

/// One recurring unit of work.
///
/// `run` is never called concurrently with itself by the scheduler.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), JobError>;
}

/// Job execution failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    /// A dependency (producer, scorer, backend) could not be reached. The job
    /// is retried on its next scheduled run only.
    #[error("dependency unavailable: {0}")]
    Transient(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("aborted at shutdown")]
    Aborted,

    #[error("{0}")]
    Failed(String),
}

impl From<CoreError> for JobError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::TransientDependency(msg) => JobError::Transient(msg),
            other => JobError::Failed(other.to_string()),
        }
    }
}

/// Per-job scheduling options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Pause between the end of one run and the start of the next.
    pub interval: Duration,
    /// Disabled jobs are listed but never run.
    pub enabled: bool,
    /// Run once immediately on start instead of waiting one interval.
    pub run_on_start: bool,
}

impl JobConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            enabled: true,
            run_on_start: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }
}

/// Result of the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure { error: String },
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub interval_secs: f64,
    pub enabled: bool,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_outcome: Option<JobOutcome>,
    pub successes: u64,
    pub failures: u64,
}

impl JobDescriptor {
    pub(crate) fn new(name: &str, config: &JobConfig) -> Self {
        Self {
            name: name.to_string(),
            interval_secs: config.interval.as_secs_f64(),
            enabled: config.enabled,
            running: false,
            last_run_at: None,
            last_duration_ms: None,
            last_outcome: None,
            successes: 0,
            failures: 0,
        }
    }

    pub(crate) fn record(&mut self, started_at: DateTime<Utc>, elapsed: Duration, result: &Result<(), JobError>) {
        self.running = false;
        self.last_run_at = Some(started_at);
        self.last_duration_ms = Some(elapsed.as_millis() as u64);
        match result {
            Ok(()) => {
                self.successes += 1;
                self.last_outcome = Some(JobOutcome::Success);
            }
            Err(e) => {
                self.failures += 1;
                self.last_outcome = Some(JobOutcome::Failure {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Close out a run that was cut off. No-op when nothing was running.
    pub(crate) fn record_aborted(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.last_duration_ms = None;
        self.failures += 1;
        self.last_outcome = Some(JobOutcome::Failure {
            error: JobError::Aborted.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_counts_outcomes() {
        let mut d = JobDescriptor::new("fetch", &JobConfig::every(Duration::from_secs(30)));
        let now = Utc::now();

        d.record(now, Duration::from_millis(12), &Ok(()));
        d.record(now, Duration::from_millis(5), &Err(JobError::Transient("producer down".into())));

        assert_eq!(d.successes, 1);
        assert_eq!(d.failures, 1);
        assert_eq!(d.last_duration_ms, Some(5));
        assert_eq!(
            d.last_outcome,
            Some(JobOutcome::Failure {
                error: "dependency unavailable: producer down".into()
            })
        );
    }

    #[test]
    fn aborting_only_counts_a_run_in_progress() {
        let mut d = JobDescriptor::new("retention", &JobConfig::every(Duration::from_secs(3600)));
        d.record_aborted();
        assert_eq!(d.failures, 0);
        assert_eq!(d.last_outcome, None);

        d.running = true;
        d.record_aborted();
        assert!(!d.running);
        assert_eq!(d.failures, 1);
        assert_eq!(d.last_duration_ms, None);
        assert_eq!(
            d.last_outcome,
            Some(JobOutcome::Failure {
                error: "aborted at shutdown".into()
            })
        );
    }

    #[test]
    fn transient_core_errors_stay_transient() {
        let err: JobError = CoreError::transient("cache down").into();
        assert_eq!(err, JobError::Transient("cache down".into()));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(JobOutcome::Failure { error: "x".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failure", "error": "x"}));
    }
}
