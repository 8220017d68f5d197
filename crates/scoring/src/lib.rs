//! `attackmap-scoring`
//!
//! **Responsibility:** Scoring collaborator boundary used by the enrichment job.
//!
//! This crate only defines the seam:
//! - A [`Scorer`] takes one stored record and returns a confidence in `[0, 1]`.
//! - It must not mutate the record; the caller persists the outcome.
//! - The real classification model lives outside this workspace; a trivial
//!   [`HeuristicScorer`] is provided for development and tests.

pub mod heuristic;
pub mod scorer;

pub use heuristic::HeuristicScorer;
pub use scorer::{FnScorer, ScoreError, Scorer, checked_score};
