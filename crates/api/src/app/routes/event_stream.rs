//! Live attack stream over Server-Sent Events.
//!
//! Each request becomes one fan-out connection. The fan-out manager owns
//! delivery (rate cap, per-connection queue); this handler only bridges the
//! connection's channel into an SSE body. Dropping the body (client gone)
//! closes the channel, which the manager observes as transport closure.

use std::time::Duration;

use axum::{
    extract::Extension,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use attackmap_core::EventRecord;
use attackmap_events::ChannelTransport;

use crate::app::{AppState, errors};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// GET /api/v1/events/stream
pub async fn stream_events(Extension(state): Extension<AppState>) -> axum::response::Response {
    let buffer = state.ctx.fanout.config().queue_capacity;
    let (transport, rx) = ChannelTransport::<EventRecord>::pair(buffer);

    let handle = match state.ctx.fanout.subscribe(transport).await {
        Ok(h) => h,
        Err(e) => return errors::fanout_error_to_response(e),
    };
    debug!(connection_id = %handle.id(), "sse subscriber admitted");

    let connected = SseEvent::default()
        .event("connected")
        .json_data(json!({ "connection_id": handle.id().to_string() }));

    let records = ReceiverStream::new(rx).map(|record| SseEvent::default().event("attack").json_data(record));

    let stream = tokio_stream::once(connected).chain(records);

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
        .into_response()
}
