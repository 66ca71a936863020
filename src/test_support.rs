//! In-memory fakes shared by unit and router tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        api_key::{Endpoint, EndpointApiKey},
        application::Application,
        role::{Actions, Permission, Role, bare_object_name},
        service::{Connection, Service},
        usage::NewApiUsage,
    },
    services::{
        authorization::{Authorizer, StrategyPolicy},
        directory::MetadataStore,
        host_resolver::HostResolver,
        key_issuer::ApiKeyIssuer,
        pool_registry::ConnectionSpec,
        procedure_executor::{ProcedureCall, ProcedureRunner},
        ttl_store::{InMemoryTtlStore, RateLimiter},
        usage_recorder::{UsageRecorder, UsageSink},
        vault::CredentialVault,
    },
    state::AppState,
};

pub const TEST_SECRET: &str = "test-credential-secret";
pub const TARGET_PASSWORD: &str = "target-db-password";

#[derive(Default)]
struct Records {
    applications: Vec<Application>,
    roles: Vec<Role>,
    services: Vec<Service>,
    connections: Vec<Connection>,
    endpoints: Vec<Endpoint>,
    api_keys: Vec<EndpointApiKey>,
}

/// [`MetadataStore`] over plain vectors.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    fn with<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        let mut records = self.records.lock().unwrap();
        f(&mut records)
    }

    pub fn add_connection(&self, host: &str, port: i32, failover: Option<&str>) -> Uuid {
        let connection = Connection {
            id: Uuid::new_v4(),
            name: format!("{host}-connection"),
            host: host.to_string(),
            port,
            username: "svc_reader".into(),
            password_encrypted: CredentialVault::new(TEST_SECRET).encrypt(TARGET_PASSWORD),
            failover_host: failover.map(str::to_string),
        };
        let id = connection.id;
        self.with(|r| r.connections.push(connection));
        id
    }

    pub fn add_service(&self, service: Service) {
        self.with(|r| r.services.push(service));
    }

    pub fn add_role(&self, role: Role) {
        self.with(|r| r.roles.push(role));
    }

    pub fn add_application(&self, application: Application) {
        self.with(|r| r.applications.push(application));
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) {
        self.with(|r| r.endpoints.push(endpoint));
    }

    pub fn set_application_active(&self, id: Uuid, active: bool) {
        self.with(|r| {
            r.applications
                .iter_mut()
                .filter(|a| a.id == id)
                .for_each(|a| a.is_active = active)
        });
    }

    pub fn set_role_active(&self, id: Uuid, active: bool) {
        self.with(|r| {
            r.roles
                .iter_mut()
                .filter(|role| role.id == id)
                .for_each(|role| role.is_active = active)
        });
    }

    /// Point a service's inline connection at `host:port`.
    pub fn set_service_target(&self, id: Uuid, host: &str, port: u16, failover: Option<&str>) {
        self.with(|r| {
            for service in r.services.iter_mut().filter(|s| s.id == id) {
                service.host = Some(host.to_string());
                service.port = Some(i32::from(port));
                service.failover_host = failover.map(str::to_string);
            }
        });
    }

    pub fn active_key_count(&self, endpoint_id: Uuid) -> usize {
        self.with(|r| {
            r.api_keys
                .iter()
                .filter(|k| k.endpoint_id == endpoint_id && k.is_active)
                .count()
        })
    }

    pub fn last_used(&self, key: &str) -> Option<DateTime<Utc>> {
        self.with(|r| r.api_keys.iter().find(|k| k.key == key).and_then(|k| k.last_used))
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn application_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Application>, AppError> {
        Ok(self.with(|r| {
            r.applications
                .iter()
                .find(|a| a.api_key_identifier == identifier)
                .cloned()
        }))
    }

    async fn application_by_legacy_key(&self, key: &str) -> Result<Option<Application>, AppError> {
        Ok(self.with(|r| {
            r.applications
                .iter()
                .find(|a| a.legacy_api_key.as_deref() == Some(key))
                .cloned()
        }))
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>, AppError> {
        Ok(self.with(|r| r.roles.iter().find(|role| role.id == id).cloned()))
    }

    async fn active_service(&self, name: &str) -> Result<Option<Service>, AppError> {
        Ok(self.with(|r| {
            r.services
                .iter()
                .find(|s| s.name == name && s.is_active)
                .cloned()
        }))
    }

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, AppError> {
        Ok(self.with(|r| r.connections.iter().find(|c| c.id == id).cloned()))
    }

    async fn active_api_key(&self, key: &str) -> Result<Option<EndpointApiKey>, AppError> {
        Ok(self.with(|r| {
            r.api_keys
                .iter()
                .find(|k| k.key == key && k.is_active)
                .cloned()
        }))
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, AppError> {
        Ok(self.with(|r| r.endpoints.iter().find(|e| e.id == id).cloned()))
    }

    async fn touch_api_key(&self, id: Uuid) -> Result<(), AppError> {
        self.with(|r| {
            r.api_keys
                .iter_mut()
                .filter(|k| k.id == id)
                .for_each(|k| k.last_used = Some(Utc::now()))
        });
        Ok(())
    }

    async fn replace_endpoint_key(&self, endpoint_id: Uuid, key: &str) -> Result<(), AppError> {
        self.with(|r| {
            r.api_keys
                .iter_mut()
                .filter(|k| k.endpoint_id == endpoint_id)
                .for_each(|k| k.is_active = false);
            r.api_keys.push(EndpointApiKey {
                id: Uuid::new_v4(),
                key: key.to_string(),
                endpoint_id,
                is_active: true,
                last_used: None,
                created_at: Utc::now(),
            });
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// An active service with inline connection details and an encrypted password.
pub fn service_fixture(name: &str) -> Service {
    Service {
        id: Uuid::new_v4(),
        name: name.to_string(),
        host: Some("db-primary.internal".into()),
        port: Some(5432),
        username: Some("svc_reader".into()),
        password_encrypted: Some(CredentialVault::new(TEST_SECRET).encrypt(TARGET_PASSWORD)),
        failover_host: None,
        connection_id: None,
        database_name: format!("{name}_db"),
        is_active: true,
    }
}

/// Keys and ids of one fully seeded tenant.
#[derive(Debug, Clone)]
pub struct TestKeys {
    pub full_key: String,
    pub identifier: String,
    pub legacy_key: String,
    pub endpoint_key: String,
    pub application_id: Uuid,
    pub role_id: Uuid,
    pub service_id: Uuid,
    pub endpoint_id: Uuid,
}

impl TestKeys {
    /// Seed a service, a role granting `actions` on `procedure`, an application
    /// holding that role, and an endpoint key for the same procedure.
    pub async fn seed(store: &MemoryStore, service: &str, procedure: &str, actions: Actions) -> Self {
        Self::seed_with_object(store, service, procedure, actions).await
    }

    pub async fn seed_with_object(
        store: &MemoryStore,
        service_name: &str,
        object_name: &str,
        actions: Actions,
    ) -> Self {
        let issuer = ApiKeyIssuer::new(4);

        let service = service_fixture(service_name);
        let service_id = service.id;
        store.add_service(service);

        let role = Role {
            id: Uuid::new_v4(),
            name: format!("{service_name}-role"),
            permissions: Json(vec![Permission {
                service_id,
                object_name: object_name.to_string(),
                actions,
            }]),
            is_active: true,
        };
        let role_id = role.id;
        store.add_role(role);

        let generated = issuer.generate();
        let full_key = generated.full_key();
        let legacy_key = format!("lk_{}", hex::encode(rand::random::<[u8; 16]>()));
        let application = Application {
            id: Uuid::new_v4(),
            name: format!("{service_name}-client"),
            api_key_identifier: generated.identifier.clone(),
            api_key_hash: issuer.hash_key(&full_key).await.unwrap(),
            legacy_api_key: Some(legacy_key.clone()),
            default_role_id: Some(role_id),
            is_active: true,
        };
        let application_id = application.id;
        store.add_application(application);

        let bare = bare_object_name(object_name);
        let procedure = bare.strip_prefix("dbo.").unwrap_or(bare);
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            service_id,
            procedure_name: procedure.to_string(),
            is_active: true,
        };
        let endpoint_id = endpoint.id;
        store.add_endpoint(endpoint);
        let endpoint_key = issuer.issue_endpoint_key(store, endpoint_id).await.unwrap();

        TestKeys {
            full_key,
            identifier: generated.identifier,
            legacy_key,
            endpoint_key,
            application_id,
            role_id,
            service_id,
            endpoint_id,
        }
    }
}

/// [`ProcedureRunner`] returning canned rows and recording every call.
#[derive(Default)]
pub struct FakeRunner {
    rows: Vec<Value>,
    failure: Option<(String, String)>,
    calls: Mutex<Vec<(ConnectionSpec, ProcedureCall)>>,
}

impl FakeRunner {
    pub fn returning(rows: Vec<Value>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn failing(message: &str, code: &str) -> Self {
        Self {
            failure: Some((message.to_string(), code.to_string())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(ConnectionSpec, ProcedureCall)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcedureRunner for FakeRunner {
    async fn execute(
        &self,
        spec: &ConnectionSpec,
        call: &ProcedureCall,
    ) -> Result<Vec<Value>, AppError> {
        self.calls.lock().unwrap().push((spec.clone(), call.clone()));
        match &self.failure {
            Some((message, code)) => Err(AppError::UpstreamFailure {
                message: message.clone(),
                code: Some(code.clone()),
            }),
            None => Ok(self.rows.clone()),
        }
    }
}

/// [`UsageSink`] forwarding rows to a channel, or failing every write.
pub struct ChannelUsageSink {
    tx: Option<mpsc::UnboundedSender<NewApiUsage>>,
}

impl ChannelUsageSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NewApiUsage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn failing() -> Self {
        Self { tx: None }
    }
}

#[async_trait]
impl UsageSink for ChannelUsageSink {
    async fn append(&self, usage: &NewApiUsage) -> Result<(), AppError> {
        match &self.tx {
            Some(tx) => tx
                .send(usage.clone())
                .map_err(|e| AppError::Internal(e.to_string())),
            None => Err(AppError::Internal("usage sink unavailable".into())),
        }
    }
}

/// Application state over the given fakes.
pub fn test_state(
    store: Arc<MemoryStore>,
    runner: Arc<FakeRunner>,
    sink: ChannelUsageSink,
    policy: StrategyPolicy,
) -> AppState {
    let authorizer = Authorizer::new(
        store.clone(),
        Arc::new(InMemoryTtlStore::new()),
        ApiKeyIssuer::new(4),
        RateLimiter::new(0),
        policy,
    );

    AppState {
        store,
        authorizer,
        vault: Arc::new(CredentialVault::new(TEST_SECRET)),
        host_resolver: HostResolver::new(Duration::from_millis(300)),
        runner,
        usage: UsageRecorder::new(Arc::new(sink)),
    }
}
