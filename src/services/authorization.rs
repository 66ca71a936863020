//! Request authorization for procedure calls.
//!
//! One [`Authorizer`] serves three key strategies:
//!
//! - **Consolidated**: `identifier.secret` keys verified against a bcrypt hash,
//!   then role, service and an explicit per-method permission check.
//! - **Legacy**: plaintext application keys; a role grants a procedure by holding
//!   any permission for `/proc/dbo.<procedure>` on the service.
//! - **Simple**: opaque endpoint keys on the public route, scoped to one
//!   (service, procedure) pair with no role involved.
//!
//! The internal route picks Consolidated or Legacy per service from the
//! configured allow-list; the public route always uses Simple.
//!
//! # Dry Run
//!
//! [`Authorizer::decide`] returns an [`AuthDecision`] value instead of writing a
//! response. In [`DecisionMode::DryRun`] it also skips every side effect (rate
//! counters, `last_used` stamps), so a service being migrated can have the
//! Consolidated strategy evaluated next to the governing Legacy one and any
//! disagreement logged without affecting the caller.

use std::{sync::Arc, time::Instant};

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::{Config, split_list},
    error::AppError,
    models::{application::Application, role::Role, service::Service},
    services::{
        directory::MetadataStore,
        key_issuer::{ApiKeyIssuer, KeyError},
        ttl_store::{RateLimiter, TtlStore, revoked_key},
        usage_recorder::UsageTrace,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    Legacy,
    Consolidated,
    Simple,
}

impl AuthStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::Legacy => "legacy",
            AuthStrategy::Consolidated => "consolidated",
            AuthStrategy::Simple => "simple",
        }
    }
}

/// Which route family a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `/api/{service}/_proc/{procedure}`
    Internal,
    /// `/public/{service}/_proc/{procedure}`
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionMode {
    Live,
    /// Evaluate without side effects or success logging.
    DryRun,
}

/// Per-service strategy selection.
///
/// Service names compare case-insensitively. `*` in the consolidated list
/// moves every service to the Consolidated strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyPolicy {
    consolidated: Vec<String>,
    consolidate_all: bool,
    shadowed: Vec<String>,
}

impl StrategyPolicy {
    pub fn new(consolidated: Vec<String>, shadowed: Vec<String>) -> Self {
        let consolidate_all = consolidated.iter().any(|s| s == "*");
        Self {
            consolidated: consolidated.into_iter().map(|s| s.to_lowercase()).collect(),
            consolidate_all,
            shadowed: shadowed.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            split_list(&config.consolidated_auth_services),
            split_list(&config.shadow_auth_services),
        )
    }

    pub fn select(&self, route: RouteKind, service: &str) -> AuthStrategy {
        match route {
            RouteKind::Public => AuthStrategy::Simple,
            RouteKind::Internal if self.is_consolidated(service) => AuthStrategy::Consolidated,
            RouteKind::Internal => AuthStrategy::Legacy,
        }
    }

    /// Whether the Consolidated strategy should also run in dry-run for `service`.
    ///
    /// Only Legacy-governed internal requests are shadowed.
    pub fn shadows(&self, route: RouteKind, service: &str) -> bool {
        self.select(route, service) == AuthStrategy::Legacy
            && self.shadowed.contains(&service.to_lowercase())
    }

    fn is_consolidated(&self, service: &str) -> bool {
        self.consolidate_all || self.consolidated.contains(&service.to_lowercase())
    }
}

/// The parts of a request authorization looks at.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// Value of the key header, if present.
    pub key: Option<&'a str>,
    pub service: &'a str,
    pub procedure: &'a str,
    pub method: &'a Method,
}

/// Everything resolved for an authorized request.
///
/// Inserted into request extensions; handlers extract it with
/// `Extension<AuthContext>`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub strategy: AuthStrategy,
    /// `None` on the public route, where keys belong to endpoints.
    pub application: Option<Application>,
    pub service: Service,
    pub procedure: String,
    pub correlation_id: Uuid,
}

/// Outcome of an authorization attempt, plus what was resolved on the way.
#[derive(Debug)]
pub struct AuthDecision {
    pub strategy: AuthStrategy,
    pub outcome: Result<AuthContext, AppError>,
    pub trace: UsageTrace,
}

impl AuthDecision {
    pub fn is_authorized(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Status this decision would produce before the handler runs.
    pub fn status(&self) -> StatusCode {
        match &self.outcome {
            Ok(_) => StatusCode::OK,
            Err(err) => err.status_code(),
        }
    }
}

#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn MetadataStore>,
    ttl: Arc<dyn TtlStore>,
    issuer: ApiKeyIssuer,
    limiter: RateLimiter,
    policy: StrategyPolicy,
}

impl Authorizer {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        ttl: Arc<dyn TtlStore>,
        issuer: ApiKeyIssuer,
        limiter: RateLimiter,
        policy: StrategyPolicy,
    ) -> Self {
        Self {
            store,
            ttl,
            issuer,
            limiter,
            policy,
        }
    }

    /// Authorize a live request with the strategy governing its service.
    ///
    /// Shadowed services additionally get a dry-run Consolidated decision; a
    /// disagreement is logged and the governing decision is returned unchanged.
    pub async fn authorize(&self, route: RouteKind, request: &AuthRequest<'_>) -> AuthDecision {
        let strategy = self.governing_strategy(route, request).await;
        let decision = self.decide(strategy, request, DecisionMode::Live).await;

        if strategy == AuthStrategy::Legacy && self.policy.shadows(route, request.service) {
            let shadow = self
                .decide(AuthStrategy::Consolidated, request, DecisionMode::DryRun)
                .await;
            report_shadow(request, &decision, &shadow);
        }

        decision
    }

    /// The configured strategy for `request`, except that an `identifier.secret`
    /// key aimed at a service with no active record is judged by Consolidated.
    /// Legacy rejects that key shape before it ever looks the service up, which
    /// would turn an unknown service into a key failure.
    async fn governing_strategy(&self, route: RouteKind, request: &AuthRequest<'_>) -> AuthStrategy {
        let strategy = self.policy.select(route, request.service);
        if strategy != AuthStrategy::Legacy {
            return strategy;
        }

        let application_key = request
            .key
            .is_some_and(|key| ApiKeyIssuer::parse(key).is_ok());
        if !application_key {
            return strategy;
        }

        match self.store.active_service(request.service).await {
            Ok(None) => AuthStrategy::Consolidated,
            _ => strategy,
        }
    }

    /// Evaluate one strategy against `request`.
    pub async fn decide(
        &self,
        strategy: AuthStrategy,
        request: &AuthRequest<'_>,
        mode: DecisionMode,
    ) -> AuthDecision {
        let started = Instant::now();
        let mut trace = UsageTrace::default();

        let outcome = match strategy {
            AuthStrategy::Consolidated => self.consolidated(request, mode, &mut trace).await,
            AuthStrategy::Legacy => self.legacy(request, mode, &mut trace).await,
            AuthStrategy::Simple => self.simple(request, mode, &mut trace).await,
        };

        if mode == DecisionMode::Live {
            match &outcome {
                Ok(context) => tracing::info!(
                    strategy = strategy.as_str(),
                    service = %request.service,
                    procedure = %request.procedure,
                    method = %request.method,
                    application_id = ?trace.application_id,
                    correlation_id = %context.correlation_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request authorized"
                ),
                Err(err) => tracing::info!(
                    strategy = strategy.as_str(),
                    service = %request.service,
                    procedure = %request.procedure,
                    method = %request.method,
                    status = err.status_code().as_u16(),
                    reason = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request denied"
                ),
            }
        }

        AuthDecision {
            strategy,
            outcome,
            trace,
        }
    }

    async fn consolidated(
        &self,
        request: &AuthRequest<'_>,
        mode: DecisionMode,
        trace: &mut UsageTrace,
    ) -> Result<AuthContext, AppError> {
        let presented = request.key.ok_or(KeyError::MissingKey)?;
        let parsed = ApiKeyIssuer::parse(presented)?;

        if self.ttl.contains(&revoked_key(parsed.identifier)).await {
            return Err(AppError::invalid_key());
        }

        let application = self
            .store
            .application_by_identifier(parsed.identifier)
            .await?
            .filter(|app| app.is_active)
            .ok_or(KeyError::KeyNotFound)?;

        self.issuer
            .verify(presented, &application.api_key_hash)
            .await?;
        trace.application_id = Some(application.id);

        self.check_rate(mode, &application.id.to_string()).await?;

        let role = self.active_role(&application).await?;
        trace.role = Some(role.clone());

        let service = self.active_service(request.service).await?;
        trace.service_id = Some(service.id);

        let granted = role
            .permissions()
            .iter()
            .any(|p| p.grants(service.id, request.procedure, request.method));
        if !granted {
            return Err(AppError::insufficient_permissions(
                request.procedure,
                &service.name,
                request.method.as_str(),
            ));
        }

        Ok(context(AuthStrategy::Consolidated, Some(application), service, request))
    }

    async fn legacy(
        &self,
        request: &AuthRequest<'_>,
        mode: DecisionMode,
        trace: &mut UsageTrace,
    ) -> Result<AuthContext, AppError> {
        let presented = request.key.ok_or(KeyError::MissingKey)?;

        let application = self
            .store
            .application_by_legacy_key(presented)
            .await?
            .filter(|app| app.is_active)
            .ok_or(KeyError::KeyNotFound)?;

        // Revoking an identifier cuts off the application's legacy key as well
        if self.ttl.contains(&revoked_key(&application.api_key_identifier)).await {
            return Err(AppError::invalid_key());
        }
        trace.application_id = Some(application.id);

        self.check_rate(mode, &application.id.to_string()).await?;

        let role = self.active_role(&application).await?;
        trace.role = Some(role.clone());

        let service = self.active_service(request.service).await?;
        trace.service_id = Some(service.id);

        let granted = role
            .permissions()
            .iter()
            .any(|p| p.service_id == service.id && p.names_legacy_object(request.procedure));
        if !granted {
            return Err(AppError::insufficient_permissions(
                request.procedure,
                &service.name,
                request.method.as_str(),
            ));
        }

        Ok(context(AuthStrategy::Legacy, Some(application), service, request))
    }

    async fn simple(
        &self,
        request: &AuthRequest<'_>,
        mode: DecisionMode,
        trace: &mut UsageTrace,
    ) -> Result<AuthContext, AppError> {
        let presented = request.key.ok_or(KeyError::MissingKey)?;

        let api_key = self
            .store
            .active_api_key(presented)
            .await?
            .ok_or(KeyError::KeyNotFound)?;

        let endpoint = self
            .store
            .endpoint(api_key.endpoint_id)
            .await?
            .filter(|endpoint| endpoint.is_active)
            .ok_or(KeyError::KeyNotFound)?;

        self.check_rate(mode, &api_key.id.to_string()).await?;

        let service = self.active_service(request.service).await?;
        trace.service_id = Some(service.id);

        let in_scope = endpoint.service_id == service.id
            && endpoint.procedure_name.eq_ignore_ascii_case(request.procedure);
        if !in_scope {
            return Err(AppError::Unauthorized {
                message: "API key not valid for this endpoint".to_string(),
                details: Some(json!({
                    "procedure": request.procedure,
                    "service": service.name,
                })),
            });
        }

        if mode == DecisionMode::Live {
            let store = Arc::clone(&self.store);
            let key_id = api_key.id;
            tokio::spawn(async move {
                if let Err(e) = store.touch_api_key(key_id).await {
                    tracing::warn!(api_key_id = %key_id, error = %e, "Failed to update key last_used");
                }
            });
        }

        Ok(context(AuthStrategy::Simple, None, service, request))
    }

    async fn active_role(&self, application: &Application) -> Result<Role, AppError> {
        let Some(role_id) = application.default_role_id else {
            return Err(AppError::no_active_role());
        };

        self.store
            .role(role_id)
            .await?
            .filter(|role| role.is_active)
            .ok_or_else(AppError::no_active_role)
    }

    async fn active_service(&self, name: &str) -> Result<Service, AppError> {
        self.store
            .active_service(name)
            .await?
            .filter(|service| service.is_active)
            .ok_or_else(|| AppError::service_not_found(name))
    }

    async fn check_rate(&self, mode: DecisionMode, subject: &str) -> Result<(), AppError> {
        if mode == DecisionMode::DryRun {
            return Ok(());
        }
        if self.limiter.check(self.ttl.as_ref(), subject).await {
            Ok(())
        } else {
            Err(AppError::RateLimited)
        }
    }
}

fn context(
    strategy: AuthStrategy,
    application: Option<Application>,
    service: Service,
    request: &AuthRequest<'_>,
) -> AuthContext {
    AuthContext {
        strategy,
        application,
        service,
        procedure: request.procedure.to_string(),
        correlation_id: Uuid::new_v4(),
    }
}

fn report_shadow(request: &AuthRequest<'_>, live: &AuthDecision, shadow: &AuthDecision) {
    if live.status() == shadow.status() {
        tracing::debug!(
            service = %request.service,
            procedure = %request.procedure,
            status = live.status().as_u16(),
            "Shadow authorization agrees"
        );
        return;
    }

    tracing::warn!(
        service = %request.service,
        procedure = %request.procedure,
        method = %request.method,
        live_strategy = live.strategy.as_str(),
        live_status = live.status().as_u16(),
        shadow_strategy = shadow.strategy.as_str(),
        shadow_status = shadow.status().as_u16(),
        shadow_authorized = shadow.is_authorized(),
        shadow_reason = ?shadow.outcome.as_ref().err().map(|e| e.to_string()),
        "Shadow authorization disagrees with live decision"
    );
}
