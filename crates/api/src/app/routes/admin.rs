//! Operational diagnostics: scheduled jobs and live subscriber connections.

use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::app::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(jobs))
        .route("/connections", get(connections))
}

/// GET /api/v1/admin/jobs
pub async fn jobs(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let jobs = state.scheduler.describe_jobs();
    Json(json!({
        "count": jobs.len(),
        "jobs": jobs,
    }))
}

/// GET /api/v1/admin/connections
pub async fn connections(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let fanout = &state.ctx.fanout;
    Json(json!({
        "live": fanout.live_count(),
        "max": fanout.config().max_connections,
        "connections": fanout.connections(),
    }))
}
