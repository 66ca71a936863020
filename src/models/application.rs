//! Application (tenant) model.
//!
//! An application owns one API key and points at the role that scopes what the
//! key may call.

use uuid::Uuid;

/// Represents an application record from the database.
///
/// # Database Table
///
/// Maps to the `applications` table with columns:
/// - `api_key_identifier`: plaintext first half of the key, unique and indexed
/// - `api_key_hash`: bcrypt hash of the full `identifier.secret` key
/// - `legacy_api_key`: plaintext key still accepted by the legacy strategy
/// - `default_role_id`: role consulted for authorization
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Application {
    pub id: Uuid,

    pub name: String,

    pub api_key_identifier: String,

    pub api_key_hash: String,

    /// `None` once an application has been moved off the legacy strategy.
    pub legacy_api_key: Option<String>,

    pub default_role_id: Option<Uuid>,

    /// Inactive applications are rejected with the same response as unknown keys.
    pub is_active: bool,
}
