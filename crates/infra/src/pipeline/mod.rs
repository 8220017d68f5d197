//! The recurring jobs that move records through the store.

pub mod enrichment;
pub mod ingestion;
pub mod retention;

pub use enrichment::{EnrichmentJob, EnrichmentStats};
pub use ingestion::{IngestionJob, IngestionStats};
pub use retention::RetentionJob;
