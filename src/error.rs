//! Error types and HTTP error response handling.
//!
//! Every failure on the request path ends up as an [`AppError`], and
//! [`IntoResponse`] is the single place where errors become HTTP responses.
//!
//! # Response Format
//!
//! ```json
//! {
//!   "message": "Insufficient permissions",
//!   "details": { "procedure": "uspGetCustomers", "service": "salesdemo_staging", "method": "GET" }
//! }
//! ```
//!
//! Internal failures never expose their cause. They are logged server-side and the
//! client receives a generated `requestId` to quote when reporting the problem.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::services::{host_resolver::HostResolutionError, key_issuer::KeyError, vault::VaultError};

/// Client-visible message shared by unknown identifiers, inactive applications,
/// revoked identifiers and hash mismatches.
pub const INVALID_KEY_MESSAGE: &str = "Invalid or inactive API key";

/// Application-wide error type.
///
/// # Status Code Mapping
///
/// - `MalformedRequest` → 400
/// - `Unauthenticated` → 401
/// - `Unauthorized` → 403
/// - `NotFound` → 404
/// - `RateLimited` → 429
/// - `UpstreamFailure` → 500 with the driver message and code kept
/// - `Database`, `Credential`, `Internal` → 500 with a generated request id only
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Metadata store query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Garbled URL shape, parameter names or request body.
    #[error("{0}")]
    MalformedRequest(String),

    /// Missing, invalid or unverifiable API key.
    #[error("{0}")]
    Unauthenticated(String),

    /// Valid key denied by role, permission or endpoint scope.
    #[error("{message}")]
    Unauthorized {
        message: String,
        details: Option<Value>,
    },

    /// Unknown or inactive service.
    #[error("{message}")]
    NotFound {
        message: String,
        details: Option<Value>,
    },

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Target database unreachable, rejected the credentials, or failed the call.
    #[error("{message}")]
    UpstreamFailure {
        message: String,
        code: Option<String>,
    },

    /// Stored credential could not be decrypted.
    #[error("Credential error: {0}")]
    Credential(#[from] VaultError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_key() -> Self {
        AppError::Unauthenticated(INVALID_KEY_MESSAGE.to_string())
    }

    pub fn no_active_role() -> Self {
        AppError::Unauthorized {
            message: "No active role assigned to this application".to_string(),
            details: None,
        }
    }

    pub fn service_not_found(service_name: &str) -> Self {
        AppError::NotFound {
            message: "Service not found or inactive".to_string(),
            details: Some(json!({ "serviceName": service_name })),
        }
    }

    pub fn insufficient_permissions(procedure: &str, service: &str, method: &str) -> Self {
        AppError::Unauthorized {
            message: "Insufficient permissions".to_string(),
            details: Some(json!({
                "procedure": procedure,
                "service": service,
                "method": method,
            })),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        AppError::UpstreamFailure {
            message: message.into(),
            code: None,
        }
    }

    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamFailure { .. }
            | AppError::Database(_)
            | AppError::Credential(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KeyError> for AppError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::MissingKey => AppError::Unauthenticated("API key required".to_string()),
            KeyError::MalformedKey => {
                AppError::Unauthenticated("Invalid API key format".to_string())
            }
            // Same response for both so callers cannot probe which identifiers exist
            KeyError::KeyNotFound | KeyError::KeyMismatch => AppError::invalid_key(),
            KeyError::Hashing(msg) => AppError::Internal(msg),
        }
    }
}

impl From<HostResolutionError> for AppError {
    fn from(err: HostResolutionError) -> Self {
        AppError::upstream(err.to_string())
    }
}

/// Convert AppError into an HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match self {
            AppError::Unauthorized { message, details } | AppError::NotFound { message, details } => {
                match details {
                    Some(details) => json!({ "message": message, "details": details }),
                    None => json!({ "message": message }),
                }
            }
            AppError::UpstreamFailure { message, code } => match code {
                Some(code) => json!({ "message": message, "details": { "code": code } }),
                None => json!({ "message": message }),
            },
            AppError::Database(_) | AppError::Credential(_) | AppError::Internal(_) => {
                let request_id = Uuid::new_v4();
                tracing::error!(%request_id, error = ?self, "Unhandled error while serving request");
                json!({ "message": "Internal server error", "requestId": request_id })
            }
            other => json!({ "message": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
