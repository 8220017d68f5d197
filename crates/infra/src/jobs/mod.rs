//! Recurring background jobs.
//!
//! ## Design
//!
//! - One timer loop per job; the next run is scheduled from the end of the
//!   previous one, so a slow run delays but never overlaps the next
//! - Failures and panics are contained per job and recorded on its descriptor
//! - Shutdown stops new runs, waits for in-flight runs up to a grace period,
//!   then aborts the rest
//!
//! ## Components
//!
//! - `Job`: one unit of recurring work
//! - `JobScheduler`: registration, then `start()`
//! - `SchedulerHandle`: descriptors and shutdown for a running scheduler

pub mod scheduler;
pub mod types;

pub use scheduler::{JobScheduler, SchedulerError, SchedulerHandle};
pub use types::{Job, JobConfig, JobDescriptor, JobError, JobOutcome};
