//! HTTP application wiring (Axum router + shared state).
//!
//! - `routes/`: one file per area (system probes, events, stream, admin)
//! - `errors.rs`: consistent JSON error responses

use axum::http::{HeaderValue, Method};
use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::warn;

use attackmap_infra::jobs::SchedulerHandle;
use attackmap_infra::{AppContext, Settings};

pub mod errors;
pub mod routes;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: AppContext,
    pub scheduler: SchedulerHandle,
}

/// Build the full HTTP router (used by `main.rs` and the black-box tests).
pub fn build_app(ctx: AppContext, scheduler: SchedulerHandle) -> Router {
    let cors = cors_layer(&ctx.settings);
    let state = AppState { ctx, scheduler };

    Router::new()
        .route("/", get(routes::system::root))
        .nest("/api/v1", routes::router())
        .layer(ServiceBuilder::new().layer(cors).layer(Extension(state)))
}

/// Read-only API: browsers from the configured origins may GET.
fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unusable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(AllowHeaders::any())
}
