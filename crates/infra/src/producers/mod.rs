//! Upstream producers of attack observations.
//!
//! A producer returns raw JSON observations; validation happens in the
//! ingestion job so one malformed entry never sinks a whole batch.

pub mod http;
pub mod synthetic;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use attackmap_core::CoreError;

use crate::config::ProducerMode;

pub use http::HttpProducer;
pub use synthetic::SyntheticProducer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error("producer unreachable: {0}")]
    Unreachable(String),

    #[error("producer timed out")]
    Timeout,

    /// The batch as a whole could not be decoded.
    #[error("malformed batch: {0}")]
    Malformed(String),

    #[error("producer not configured: {0}")]
    NotConfigured(String),
}

impl From<ProducerError> for CoreError {
    fn from(err: ProducerError) -> Self {
        match err {
            ProducerError::Malformed(msg) => CoreError::data_integrity(msg),
            other => CoreError::transient(other.to_string()),
        }
    }
}

/// One fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerBatch {
    pub observations: Vec<JsonValue>,
    /// End of the window this batch covers; passed back as `since` next time.
    pub window_end: DateTime<Utc>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Source tag stamped on every record from this producer.
    fn name(&self) -> &str;

    fn mode(&self) -> ProducerMode;

    /// Whether credentials and endpoint are present.
    fn is_configured(&self) -> bool {
        true
    }

    /// Fetch observations newer than `since` (everything recent when `None`).
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<ProducerBatch, ProducerError>;
}
