//! Health check endpoint for service monitoring.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,

    /// Metadata store connectivity. Target databases are probed per call, not here.
    pub metadata_store: &'static str,

    pub version: &'static str,

    pub timestamp: DateTime<Utc>,
}

/// Health check handler.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "metadata_store": "connected",
///   "version": "0.1.0",
///   "timestamp": "2025-01-15T10:30:00Z"
/// }
/// ```
///
/// If the metadata store is unreachable, returns the standard error response.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    state.store.ping().await?;

    Ok(Json(HealthResponse {
        status: "healthy",
        metadata_store: "connected",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    }))
}
