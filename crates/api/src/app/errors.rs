use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use attackmap_events::FanoutError;
use attackmap_infra::store::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
        StoreError::Backend(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
        StoreError::Corrupt(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "data_integrity", msg),
    }
}

pub fn fanout_error_to_response(err: FanoutError) -> axum::response::Response {
    match err {
        FanoutError::CapacityExceeded { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded", err.to_string())
        }
        FanoutError::Handshake(msg) => json_error(StatusCode::BAD_GATEWAY, "handshake_failed", msg),
        FanoutError::UnknownConnection(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
