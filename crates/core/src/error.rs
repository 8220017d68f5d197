//! Error taxonomy shared by every component.

use thiserror::Error;

/// Result type used across the pipeline.
pub type CoreResult<T> = Result<T, CoreError>;

/// Pipeline-level error.
///
/// The variants carry how the caller is expected to react, not where the
/// failure came from:
///
/// - `TransientDependency`: retried on the next scheduled cycle, never in a tight loop
/// - `DataIntegrity`: the offending record is dropped and counted
/// - `CapacityExceeded`: surfaced to the caller as a rejection
/// - `NotFound`: benign, usually a retention race
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A producer, the scorer or the cache could not be reached.
    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    /// A record failed validation (e.g. malformed producer payload).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// A bounded resource is full.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The referenced record no longer exists.
    #[error("not found")]
    NotFound,
}

impl CoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDependency(msg.into())
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether the next scheduled cycle may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDependency(_))
    }
}
