//! REST API module using Axum
//!
//! Endpoints for the monitoring stack:
//! - `GET /api/v1/stream` — live SSE change feed with keep-alive comments
//! - `GET /api/v1/health` — point-in-time daemon/stream/recovery summary
//! - `GET /api/v1/events/heal`, `GET /api/v1/events/recovery` — append-only
//!   outcome records for the external reporting collaborator
//! - `POST /api/v1/daemons/{name}/clear` — manual clear of a Degraded latch
//!
//! `/health` is kept as a legacy alias of the v1 health endpoint.

pub mod handlers;

pub use handlers::ApiState;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `VIGIL_CORS_ORIGINS` to a comma-separated list of allowed origins
/// for development dashboards served from another port.
fn build_cors_layer() -> CorsLayer {
    match std::env::var("VIGIL_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
        }
        Err(_) => CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    let cors = build_cors_layer();

    Router::new()
        .route("/api/v1/stream", get(handlers::get_stream))
        .route("/api/v1/health", get(handlers::get_health))
        .route("/api/v1/events/heal", get(handlers::get_heal_events))
        .route(
            "/api/v1/events/recovery",
            get(handlers::get_recovery_events),
        )
        .route(
            "/api/v1/daemons/:name/clear",
            post(handlers::clear_daemon),
        )
        // Legacy health alias
        .route("/health", get(handlers::get_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
