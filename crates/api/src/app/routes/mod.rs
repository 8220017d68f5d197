use axum::{Router, routing::get};

pub mod admin;
pub mod event_stream;
pub mod events;
pub mod system;

/// Router mounted under `/api/v1`.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/health/ready", get(system::ready))
        .route("/health/live", get(system::live))
        .route("/version", get(system::version))
        .route("/events", get(events::recent))
        .route("/events/stream", get(event_stream::stream_events))
        .nest("/admin", admin::router())
}
