//! Service info and health probes.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::app::AppState;

pub async fn root(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let settings = &state.ctx.settings;
    Json(json!({
        "service": "attackmap",
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": settings.environment(),
        "endpoints": {
            "health": "/api/v1/health",
            "events": "/api/v1/events",
            "stream": "/api/v1/events/stream",
        },
    }))
}

/// GET /api/v1/health
///
/// 200 with the snapshot when healthy, 503 with the same body when degraded.
pub async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let snapshot = state.ctx.health.check().await;
    let status = if snapshot.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

pub async fn ready(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let readiness = state.ctx.health.ready().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

pub async fn live(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.ctx.health.live())
}

pub async fn version(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.ctx.health.version())
}
