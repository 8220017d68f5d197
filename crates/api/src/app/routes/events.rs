//! Recent-events listing.

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use attackmap_core::EnrichmentStatus;
use attackmap_infra::store::RecentQuery;

use crate::app::{AppState, errors};

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
    /// RFC 3339 lower bound on `created_at`.
    pub since: Option<String>,
    pub status: Option<String>,
}

impl RecentParams {
    fn into_query(self) -> Result<RecentQuery, axum::response::Response> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_limit",
                format!("limit must be between 1 and {MAX_LIMIT}"),
            ));
        }

        let mut query = RecentQuery::latest(limit);

        if let Some(raw) = self.since.as_deref().filter(|s| !s.is_empty()) {
            let since = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| {
                    errors::json_error(StatusCode::BAD_REQUEST, "invalid_since", "since must be an RFC 3339 timestamp")
                })?
                .with_timezone(&Utc);
            query = query.with_since(since);
        }

        if let Some(raw) = self.status.as_deref().filter(|s| !s.is_empty()) {
            let status: EnrichmentStatus = raw.parse().map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: pending, enriched, skipped",
                )
            })?;
            query = query.with_status(status);
        }

        Ok(query)
    }
}

/// GET /api/v1/events?limit&since&status
///
/// Newest first.
pub async fn recent(
    Extension(state): Extension<AppState>,
    Query(params): Query<RecentParams>,
) -> axum::response::Response {
    let query = match params.into_query() {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match state.ctx.store.recent(&query).await {
        Ok(events) => Json(json!({
            "count": events.len(),
            "events": events,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
