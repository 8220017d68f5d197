//! `attackmap-core`: shared building blocks for the attack map pipeline.
//!
//! This crate contains **pure** types (no IO, no async): identifiers, the
//! event record model and the error taxonomy every other crate speaks.

pub mod error;
pub mod id;
pub mod record;

pub use error::{CoreError, CoreResult};
pub use id::{ConnectionId, EventId};
pub use record::{EnrichmentStatus, EventRecord, GeoLocation, RawLocation, RawObservation};
