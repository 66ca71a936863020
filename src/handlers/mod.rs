//! HTTP request handlers (route handlers) and the router that serves them.
//!
//! Each handler is an async function that:
//! 1. Receives the authorization context and request data
//! 2. Runs the call through the service layer
//! 3. Returns HTTP response (JSON, status code)

use axum::{Router, middleware as axum_middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::{middleware, state::AppState};

/// Health check endpoint
pub mod health;
/// Stored procedure endpoints
pub mod procedures;

/// Build the application router.
///
/// Procedure routes are layered as usage recording → authorization → handler,
/// so every procedure request is recorded, including denied ones. `/health`
/// is neither authorized nor recorded.
pub fn router(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route(
            "/api/{service}/_proc/{procedure}",
            get(procedures::run_internal).post(procedures::run_internal),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::internal_auth,
        ));

    let public_routes = Router::new()
        .route(
            "/public/{service}/_proc/{procedure}",
            get(procedures::run_public).post(procedures::run_public),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::public_auth,
        ));

    let procedure_routes = Router::new()
        .merge(internal_routes)
        .merge(public_routes)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::usage::record_usage,
        ));

    Router::new()
        // Public routes (no authentication required)
        .route("/health", get(health::health_check))
        .merge(procedure_routes)
        // Request/response spans for every route
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
