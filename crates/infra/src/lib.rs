//! Runtime side of the telemetry service: storage backends, the job
//! scheduler and its jobs, producers, health probes and configuration.

pub mod config;
pub mod context;
pub mod health;
pub mod jobs;
pub mod pipeline;
pub mod producers;
pub mod store;

pub use config::{ConfigError, ProducerMode, Settings};
pub use context::{AppContext, Backends, ResourceGuard};
pub use health::{HealthAggregator, HealthSnapshot, OverallStatus};
