//! Development scorer.
//!
//! Maps attack magnitude onto `[0, 1)` with a saturating curve. It carries no
//! threat intelligence and exists so the enrichment pipeline can run without
//! an external collaborator.

use async_trait::async_trait;

use attackmap_core::EventRecord;

use crate::scorer::{ScoreError, Scorer, checked_score};

#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    /// Magnitude at which the score reaches ~0.63.
    scale: f64,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self { scale: 10.0 }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        if scale.is_finite() && scale > 0.0 {
            self.scale = scale;
        }
        self
    }

    fn compute(&self, magnitude: f64) -> f64 {
        1.0 - (-magnitude / self.scale).exp()
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(&self, record: &EventRecord) -> Result<f64, ScoreError> {
        if !record.magnitude.is_finite() || record.magnitude < 0.0 {
            return Err(ScoreError::Rejected(format!(
                "magnitude {} is not scorable",
                record.magnitude
            )));
        }
        checked_score(self.compute(record.magnitude))
    }
}
