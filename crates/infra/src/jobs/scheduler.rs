//! Interval scheduler with per-job failure isolation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::types::{Job, JobConfig, JobDescriptor, JobError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("job '{0}' has a zero interval")]
    ZeroInterval(String),
}

struct Entry {
    job: Arc<dyn Job>,
    config: JobConfig,
    descriptor: Arc<Mutex<JobDescriptor>>,
}

/// Collects jobs, then runs each on its own timer loop.
#[derive(Default)]
pub struct JobScheduler {
    entries: Vec<Entry>,
    names: HashSet<String>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.names)
            .finish()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Names must be unique.
    pub fn register(&mut self, job: Arc<dyn Job>, config: JobConfig) -> Result<(), SchedulerError> {
        let name = job.name().to_string();
        if config.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name));
        }
        if !self.names.insert(name.clone()) {
            return Err(SchedulerError::DuplicateJob(name));
        }

        let descriptor = Arc::new(Mutex::new(JobDescriptor::new(&name, &config)));
        self.entries.push(Entry {
            job,
            config,
            descriptor,
        });
        Ok(())
    }

    /// Spawn one loop per enabled job. Must be called inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut descriptors = Vec::with_capacity(self.entries.len());
        let mut tasks = Vec::new();

        for entry in self.entries {
            descriptors.push(entry.descriptor.clone());

            if !entry.config.enabled {
                info!(job = %entry.job.name(), "job disabled");
                continue;
            }

            let name = entry.job.name().to_string();
            info!(job = %name, interval_secs = entry.config.interval.as_secs_f64(), "job scheduled");
            let task = tokio::spawn(job_loop(
                entry.job,
                entry.config,
                entry.descriptor.clone(),
                shutdown_rx.clone(),
            ));
            tasks.push(RunningJob {
                name,
                descriptor: entry.descriptor,
                task,
            });
        }

        SchedulerHandle {
            inner: Arc::new(HandleInner {
                descriptors,
                shutdown: shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        }
    }
}

struct RunningJob {
    name: String,
    descriptor: Arc<Mutex<JobDescriptor>>,
    task: JoinHandle<()>,
}

struct HandleInner {
    descriptors: Vec<Arc<Mutex<JobDescriptor>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<RunningJob>>,
}

/// Handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("jobs", &self.inner.descriptors.len())
            .finish()
    }
}

impl SchedulerHandle {
    /// Descriptor snapshots in registration order.
    pub fn describe_jobs(&self) -> Vec<JobDescriptor> {
        self.inner
            .descriptors
            .iter()
            .filter_map(|d| d.lock().ok().map(|d| d.clone()))
            .collect()
    }

    /// Stop starting runs, wait up to `grace` for in-flight runs, abort the
    /// rest. Aborted runs are recorded as failures. Returns the names of
    /// aborted jobs. Idempotent.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        let _ = self.inner.shutdown.send(true);

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return vec![],
        };

        let deadline = Instant::now() + grace;
        let mut aborted = Vec::new();
        for RunningJob {
            name,
            descriptor,
            mut task,
        } in tasks
        {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(job = %name, "job still running after grace period; aborting");
                task.abort();
                if let Ok(mut d) = descriptor.lock() {
                    d.record_aborted();
                }
                aborted.push(name);
            }
        }

        info!(aborted = aborted.len(), "job scheduler stopped");
        aborted
    }
}

/// Aborts the wrapped task when dropped, so aborting a job loop also stops
/// the run it was waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn job_loop(
    job: Arc<dyn Job>,
    config: JobConfig,
    descriptor: Arc<Mutex<JobDescriptor>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.run_on_start && wait_or_shutdown(&mut shutdown, config.interval).await {
        return;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        execute_once(&job, &descriptor).await;

        if wait_or_shutdown(&mut shutdown, config.interval).await {
            break;
        }
    }
}

/// Sleep for `interval`; `true` if shutdown was requested first.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(interval) => false,
    }
}

async fn execute_once(job: &Arc<dyn Job>, descriptor: &Arc<Mutex<JobDescriptor>>) {
    let name = job.name().to_string();
    if let Ok(mut d) = descriptor.lock() {
        d.running = true;
    }

    let started_at = Utc::now();
    let started = Instant::now();

    let mut run = {
        let job = job.clone();
        AbortOnDrop(tokio::spawn(async move { job.run().await }))
    };
    let result = match (&mut run.0).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            Err(JobError::Panicked(panic_message(join_err.into_panic())))
        }
        Err(join_err) => Err(JobError::Failed(format!("job task cancelled: {join_err}"))),
    };
    let elapsed = started.elapsed();

    match &result {
        Ok(()) => info!(job = %name, elapsed_ms = elapsed.as_millis() as u64, "job run completed"),
        Err(JobError::Panicked(msg)) => error!(job = %name, panic = %msg, "job run panicked"),
        Err(e) => warn!(job = %name, error = %e, "job run failed"),
    }

    if let Ok(mut d) = descriptor.lock() {
        d.record(started_at, elapsed, &result);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Job for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn run(&self) -> Result<(), JobError> {
            Err(JobError::Transient("producer unreachable".into()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn run(&self) -> Result<(), JobError> {
            panic!("boom");
        }
    }

    struct Slow {
        run_for: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self) -> Result<(), JobError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.run_for).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn every(secs: u64) -> JobConfig {
        JobConfig::every(Duration::from_secs(secs)).run_on_start(false)
    }

    fn descriptor(handle: &SchedulerHandle, name: &str) -> JobDescriptor {
        handle
            .describe_jobs()
            .into_iter()
            .find(|d| d.name == name)
            .unwrap()
    }

    #[test]
    fn duplicate_names_and_zero_intervals_are_rejected() {
        let mut scheduler = JobScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let job = || Arc::new(Counting { name: "fetch", runs: runs.clone() });

        scheduler.register(job(), every(1)).unwrap();
        assert_eq!(
            scheduler.register(job(), every(5)),
            Err(SchedulerError::DuplicateJob("fetch".into()))
        );

        let mut other = JobScheduler::new();
        assert_eq!(
            other.register(job(), JobConfig::every(Duration::ZERO)),
            Err(SchedulerError::ZeroInterval("fetch".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_affect_its_neighbour() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = JobScheduler::new();
        scheduler.register(Arc::new(AlwaysFails), every(10)).unwrap();
        scheduler
            .register(Arc::new(Counting { name: "b", runs: runs.clone() }), every(10))
            .unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(55)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        let b = descriptor(&handle, "b");
        assert_eq!(b.successes, 5);
        assert_eq!(b.failures, 0);

        let a = descriptor(&handle, "always-fails");
        assert_eq!(a.failures, 5);
        assert!(matches!(a.last_outcome, Some(JobOutcome::Failure { .. })));

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_recorded_and_the_schedule_continues() {
        let mut scheduler = JobScheduler::new();
        scheduler
            .register(Arc::new(Panics), JobConfig::every(Duration::from_secs(5)))
            .unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(12)).await;

        let d = descriptor(&handle, "panics");
        assert_eq!(d.failures, 3);
        assert_eq!(
            d.last_outcome,
            Some(JobOutcome::Failure {
                error: "job panicked: boom".into()
            })
        );
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runs_delay_the_next_run_and_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let job = Slow {
            run_for: Duration::from_secs(15),
            active: active.clone(),
            max_active: max_active.clone(),
            runs: runs.clone(),
        };

        let mut scheduler = JobScheduler::new();
        scheduler
            .register(Arc::new(job), JobConfig::every(Duration::from_secs(10)))
            .unwrap();
        let handle = scheduler.start();

        // Runs occupy [0, 15) and [25, 40); the third starts at 50.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_jobs_are_listed_but_never_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = JobScheduler::new();
        scheduler
            .register(
                Arc::new(Counting { name: "enrich", runs: runs.clone() }),
                JobConfig::every(Duration::from_secs(1)).enabled(false),
            )
            .unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let d = descriptor(&handle, "enrich");
        assert!(!d.enabled);
        assert_eq!(d.last_run_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_short_runs_and_aborts_long_ones() {
        let active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let long = Slow {
            run_for: Duration::from_secs(3600),
            active: active.clone(),
            max_active: Arc::new(AtomicUsize::new(0)),
            runs: runs.clone(),
        };

        let mut scheduler = JobScheduler::new();
        scheduler
            .register(Arc::new(long), JobConfig::every(Duration::from_secs(10)))
            .unwrap();
        let quick_runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                Arc::new(Counting { name: "quick", runs: quick_runs.clone() }),
                JobConfig::every(Duration::from_secs(10)),
            )
            .unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(active.load(Ordering::SeqCst), 1);

        assert!(descriptor(&handle, "slow").running);

        let aborted = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(aborted, vec!["slow".to_string()]);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(quick_runs.load(Ordering::SeqCst), 1);

        let slow = descriptor(&handle, "slow");
        assert!(!slow.running);
        assert_eq!(slow.failures, 1);
        assert_eq!(
            slow.last_outcome,
            Some(JobOutcome::Failure {
                error: "aborted at shutdown".into()
            })
        );
        assert!(!descriptor(&handle, "quick").running);

        // Second call finds nothing left to stop.
        assert!(handle.shutdown(Duration::from_secs(1)).await.is_empty());

        // No further runs after shutdown.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(quick_runs.load(Ordering::SeqCst), 1);
    }
}
