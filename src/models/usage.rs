//! API usage audit records.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One row of the append-only `api_usage` table.
///
/// Every request produces exactly one record, whatever its outcome. The
/// references are `None` when the request failed before they were resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApiUsage {
    pub timestamp: DateTime<Utc>,
    /// Request path as received.
    pub endpoint: String,
    pub component: String,
    pub method: String,
    /// Status actually returned to the client.
    pub status_code: i32,
    pub service_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
}
