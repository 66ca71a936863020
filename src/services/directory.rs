//! Access to the metadata records the gateway reads on every request.
//!
//! The records are owned by the admin tooling. The gateway only reads them,
//! except for endpoint key maintenance and usage appends (see
//! [`crate::services::usage_recorder`]).

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::DbPool,
    error::AppError,
    models::{
        api_key::{Endpoint, EndpointApiKey},
        application::Application,
        role::Role,
        service::{Connection, Service},
    },
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Application owning `identifier`, active or not.
    async fn application_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Application>, AppError>;

    /// Application whose plaintext legacy key is `key`, active or not.
    async fn application_by_legacy_key(&self, key: &str) -> Result<Option<Application>, AppError>;

    async fn role(&self, id: Uuid) -> Result<Option<Role>, AppError>;

    /// Active service called `name`.
    async fn active_service(&self, name: &str) -> Result<Option<Service>, AppError>;

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, AppError>;

    async fn active_api_key(&self, key: &str) -> Result<Option<EndpointApiKey>, AppError>;

    async fn endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, AppError>;

    /// Stamp `last_used` on an endpoint key.
    async fn touch_api_key(&self, id: Uuid) -> Result<(), AppError>;

    /// Deactivate the endpoint's active key and store `key` as its replacement.
    async fn replace_endpoint_key(&self, endpoint_id: Uuid, key: &str) -> Result<(), AppError>;

    /// Connectivity check for health reporting.
    async fn ping(&self) -> Result<(), AppError>;
}

/// [`MetadataStore`] backed by the PostgreSQL metadata database.
#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: DbPool,
}

impl PgMetadataStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn application_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Application>, AppError> {
        let application = sqlx::query_as::<_, Application>(
            r#"
            SELECT id, name, api_key_identifier, api_key_hash, legacy_api_key, default_role_id, is_active
            FROM applications
            WHERE api_key_identifier = $1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(application)
    }

    async fn application_by_legacy_key(&self, key: &str) -> Result<Option<Application>, AppError> {
        let application = sqlx::query_as::<_, Application>(
            r#"
            SELECT id, name, api_key_identifier, api_key_hash, legacy_api_key, default_role_id, is_active
            FROM applications
            WHERE legacy_api_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(application)
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>, AppError> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT id, name, permissions, is_active FROM roles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role)
    }

    async fn active_service(&self, name: &str) -> Result<Option<Service>, AppError> {
        let service = sqlx::query_as::<_, Service>(
            r#"
            SELECT id, name, host, port, username, password_encrypted, failover_host,
                   connection_id, database_name, is_active
            FROM services
            WHERE name = $1 AND is_active = true
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(service)
    }

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, AppError> {
        let connection = sqlx::query_as::<_, Connection>(
            r#"
            SELECT id, name, host, port, username, password_encrypted, failover_host
            FROM connections
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    async fn active_api_key(&self, key: &str) -> Result<Option<EndpointApiKey>, AppError> {
        let api_key = sqlx::query_as::<_, EndpointApiKey>(
            r#"
            SELECT id, key, endpoint_id, is_active, last_used, created_at
            FROM api_keys
            WHERE key = $1 AND is_active = true
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(api_key)
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, AppError> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            "SELECT id, service_id, procedure_name, is_active FROM endpoints WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(endpoint)
    }

    async fn touch_api_key(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE api_keys SET last_used = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn replace_endpoint_key(&self, endpoint_id: Uuid, key: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        // Deactivate first so the partial unique index never sees two active keys
        sqlx::query(
            "UPDATE api_keys SET is_active = false WHERE endpoint_id = $1 AND is_active = true",
        )
        .bind(endpoint_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO api_keys (key, endpoint_id) VALUES ($1, $2)")
            .bind(key)
            .bind(endpoint_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
