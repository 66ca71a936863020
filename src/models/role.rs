//! Role and permission models.
//!
//! A role is a named, ordered list of permissions. Each permission grants HTTP
//! methods on one database object of one service.
//!
//! # Stored Form
//!
//! `roles.permissions` is a JSONB array:
//!
//! ```json
//! [
//!   {
//!     "serviceId": "550e8400-e29b-41d4-a716-446655440000",
//!     "objectName": "/proc/uspGetCustomers",
//!     "actions": { "GET": true, "POST": false }
//!   }
//! ]
//! ```

use axum::http::Method;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// Prefix the admin tooling puts in front of procedure object names.
pub const PROC_PREFIX: &str = "/proc/";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub permissions: Json<Vec<Permission>>,
    pub is_active: bool,
}

impl Role {
    pub fn permissions(&self) -> &[Permission] {
        &self.permissions.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub service_id: Uuid,
    pub object_name: String,
    #[serde(default)]
    pub actions: Actions,
}

/// Allowed HTTP methods. Methods absent from the stored map are denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Actions {
    #[serde(default)]
    pub get: bool,
    #[serde(default)]
    pub post: bool,
    #[serde(default)]
    pub put: bool,
    #[serde(default)]
    pub patch: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Actions {
    pub fn allows(&self, method: &Method) -> bool {
        match *method {
            Method::GET => self.get,
            Method::POST => self.post,
            Method::PUT => self.put,
            Method::PATCH => self.patch,
            Method::DELETE => self.delete,
            _ => false,
        }
    }
}

impl Permission {
    /// Whether this permission names `procedure`.
    ///
    /// Case-insensitive; `uspGetX` and `/proc/uspGetX` are the same object on
    /// either side of the comparison.
    pub fn names_object(&self, procedure: &str) -> bool {
        bare_object_name(&self.object_name).eq_ignore_ascii_case(bare_object_name(procedure))
    }

    /// Whether this permission names the legacy `/proc/dbo.<procedure>` object.
    pub fn names_legacy_object(&self, procedure: &str) -> bool {
        let expected = format!("{PROC_PREFIX}dbo.{procedure}");
        self.object_name.eq_ignore_ascii_case(&expected)
    }

    pub fn grants(&self, service_id: Uuid, procedure: &str, method: &Method) -> bool {
        self.service_id == service_id
            && self.names_object(procedure)
            && self.actions.allows(method)
    }
}

/// Strip a leading `/proc/` (any case) from an object name.
pub fn bare_object_name(name: &str) -> &str {
    match name.get(..PROC_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(PROC_PREFIX) => &name[PROC_PREFIX.len()..],
        _ => name,
    }
}
