//! API usage audit trail.
//!
//! Every procedure request, authorized or not, appends one row to `api_usage`.
//! Writes run on a spawned task: a failing audit write is logged and dropped,
//! it never delays or changes the response.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::AppError,
    models::{role::Role, usage::NewApiUsage},
};

/// What authorization managed to resolve for a request, successful or not.
///
/// The auth middleware attaches it to the response extensions so usage
/// recording can attribute the request after the handler has run.
#[derive(Debug, Clone, Default)]
pub struct UsageTrace {
    pub service_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub role: Option<Role>,
}

/// Destination for usage rows.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, usage: &NewApiUsage) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct PgUsageSink {
    pool: DbPool,
}

impl PgUsageSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageSink for PgUsageSink {
    async fn append(&self, usage: &NewApiUsage) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO api_usage
                (timestamp, endpoint, component, method, status_code, service_id, role_id, application_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(usage.timestamp)
        .bind(&usage.endpoint)
        .bind(&usage.component)
        .bind(&usage.method)
        .bind(usage.status_code)
        .bind(usage.service_id)
        .bind(usage.role_id)
        .bind(usage.application_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    sink: Arc<dyn UsageSink>,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    /// Append a usage row for a finished request in the background.
    ///
    /// The returned handle is only useful to tests; callers drop it.
    pub fn record(
        &self,
        path: &str,
        method: &Method,
        status: u16,
        trace: Option<&UsageTrace>,
    ) -> tokio::task::JoinHandle<()> {
        let usage = usage_entry(path, method, status, trace);
        let sink = Arc::clone(&self.sink);

        tokio::spawn(async move {
            if let Err(e) = sink.append(&usage).await {
                tracing::warn!(
                    endpoint = %usage.endpoint,
                    status_code = usage.status_code,
                    error = %e,
                    "Failed to record API usage"
                );
            }
        })
    }
}

fn usage_entry(path: &str, method: &Method, status: u16, trace: Option<&UsageTrace>) -> NewApiUsage {
    let role = trace.and_then(|t| t.role.as_ref());

    NewApiUsage {
        timestamp: Utc::now(),
        endpoint: path.to_string(),
        component: component_for(path, role),
        method: method.as_str().to_string(),
        status_code: i32::from(status),
        service_id: trace.and_then(|t| t.service_id),
        role_id: role.map(|r| r.id),
        application_id: trace.and_then(|t| t.application_id),
    }
}

/// Name the component a request path addresses.
///
/// Takes the last non-empty path segment. When a role was resolved, a permission
/// naming that segment contributes its stored `objectName`; otherwise the raw
/// segment is used. Requests with no resolved role get `api_<segment>`.
pub fn component_for(path: &str, role: Option<&Role>) -> String {
    let segment = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("root");

    match role {
        Some(role) => role
            .permissions()
            .iter()
            .find(|p| p.names_object(segment))
            .map(|p| p.object_name.clone())
            .unwrap_or_else(|| segment.to_string()),
        None => format!("api_{segment}"),
    }
}
