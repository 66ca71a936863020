//! Usage recording middleware.
//!
//! Wraps the authorization layer so it sees the final response, including
//! denials, and records exactly one usage row per request with the status
//! actually sent.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{services::usage_recorder::UsageTrace, state::AppState};

pub async fn record_usage(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    let response = next.run(request).await;

    // Fire-and-forget; the write never holds up the response
    state.usage.record(
        &path,
        &method,
        response.status().as_u16(),
        response.extensions().get::<UsageTrace>(),
    );

    response
}
