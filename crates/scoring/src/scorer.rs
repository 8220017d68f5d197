use async_trait::async_trait;
use thiserror::Error;

use attackmap_core::{CoreError, EventRecord};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoreError {
    /// The collaborator could not be reached or timed out.
    #[error("scorer unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused this particular record.
    #[error("record rejected by scorer: {0}")]
    Rejected(String),

    #[error("score {0} is outside [0, 1]")]
    OutOfRange(f64),
}

impl From<ScoreError> for CoreError {
    fn from(err: ScoreError) -> Self {
        match err {
            ScoreError::Unavailable(msg) => CoreError::transient(msg),
            other => CoreError::data_integrity(other.to_string()),
        }
    }
}

/// Scores one record.
///
/// Implementations should be cheap to share (`Arc<dyn Scorer>`); the
/// enrichment job applies its own per-call timeout around [`Scorer::score`].
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Stable name used in logs and health output.
    fn name(&self) -> &str;

    /// Confidence in `[0, 1]`. Values outside the range are treated as failures
    /// by the caller (see [`checked_score`]).
    async fn score(&self, record: &EventRecord) -> Result<f64, ScoreError>;

    /// Whether the scorer has what it needs (credentials, endpoint) to run.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Reject NaN and values outside `[0, 1]`.
pub fn checked_score(score: f64) -> Result<f64, ScoreError> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(ScoreError::OutOfRange(score))
    }
}

/// Adapter turning a synchronous closure into a [`Scorer`].
pub struct FnScorer<F> {
    name: String,
    f: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&EventRecord) -> Result<f64, ScoreError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> core::fmt::Debug for FnScorer<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnScorer").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Scorer for FnScorer<F>
where
    F: Fn(&EventRecord) -> Result<f64, ScoreError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(&self, record: &EventRecord) -> Result<f64, ScoreError> {
        (self.f)(record)
    }
}
