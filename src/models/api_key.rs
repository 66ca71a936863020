//! Endpoint-scoped API keys for the public route.
//!
//! Unlike application keys these are opaque tokens stored as-is and bound to a
//! single endpoint. Issuing a new key for an endpoint deactivates the old one.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table. A partial unique index keeps at most one
/// active key per endpoint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EndpointApiKey {
    pub id: Uuid,

    pub key: String,

    pub endpoint_id: Uuid,

    pub is_active: bool,

    /// Updated in the background after each accepted request.
    pub last_used: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// A procedure published on the public route.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Endpoint {
    pub id: Uuid,
    pub service_id: Uuid,
    pub procedure_name: String,
    pub is_active: bool,
}
