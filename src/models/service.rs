//! Service and connection models.
//!
//! A service binds a name to a target database. Connection details are either
//! inline on the service or borrowed from a reusable [`Connection`].

use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Service {
    pub id: Uuid,

    /// Unique name used in request paths.
    pub name: String,

    pub host: Option<String>,
    pub port: Option<i32>,
    pub username: Option<String>,

    /// `hex(ciphertext):hex(iv)`
    pub password_encrypted: Option<String>,

    pub failover_host: Option<String>,

    /// When set, connection details come from this connection instead of the
    /// inline fields.
    pub connection_id: Option<Uuid>,

    pub database_name: String,

    pub is_active: bool,
}

/// Reusable database host credentials.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    /// `hex(ciphertext):hex(iv)`
    pub password_encrypted: String,
    pub failover_host: Option<String>,
}
