//! Host selection for target databases.
//!
//! A service (directly or through its connection) names a primary host and an
//! optional failover host. Before each call the primary is probed with a raw
//! TCP connect; the failover is only tried when the primary does not answer.
//!
//! There is no cached health state: every call probes again, which keeps the
//! decision fresh at the cost of one connect per request, bounded by the probe
//! timeout (2 seconds by default).

use std::time::Duration;

use tokio::net::TcpStream;

use crate::{
    error::AppError,
    models::service::Service,
    services::directory::MetadataStore,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostResolutionError {
    #[error("Primary host unreachable and no failover host configured")]
    PrimaryUnreachableNoFailover,

    #[error("Both primary and failover hosts are unreachable")]
    BothHostsUnreachable,
}

/// Where and how to reach a service's database, credentials still sealed.
#[derive(Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub primary_host: String,
    pub failover_host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password_encrypted: String,
    pub database: String,
}

impl std::fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTarget")
            .field("primary_host", &self.primary_host)
            .field("failover_host", &self.failover_host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveHost {
    Primary(String),
    Failover(String),
}

impl EffectiveHost {
    pub fn host(&self) -> &str {
        match self {
            EffectiveHost::Primary(host) | EffectiveHost::Failover(host) => host,
        }
    }
}

/// Build the host target for `service`.
///
/// Connection details come from the referenced connection when the service has
/// one, otherwise from the service's inline fields.
///
/// # Errors
///
/// `UpstreamFailure` when the referenced connection is gone, inline details are
/// incomplete, or the port is out of range.
pub async fn resolve_target(
    store: &dyn MetadataStore,
    service: &Service,
) -> Result<HostTarget, AppError> {
    let (host, port, username, password_encrypted, failover_host) = match service.connection_id {
        Some(connection_id) => {
            let connection = store.connection(connection_id).await?.ok_or_else(|| {
                AppError::upstream(format!(
                    "Connection referenced by service '{}' not found",
                    service.name
                ))
            })?;
            (
                connection.host,
                connection.port,
                connection.username,
                connection.password_encrypted,
                connection.failover_host,
            )
        }
        None => match (
            &service.host,
            service.port,
            &service.username,
            &service.password_encrypted,
        ) {
            (Some(host), Some(port), Some(username), Some(password)) => (
                host.clone(),
                port,
                username.clone(),
                password.clone(),
                service.failover_host.clone(),
            ),
            _ => {
                return Err(AppError::upstream(format!(
                    "Service '{}' has no connection details configured",
                    service.name
                )));
            }
        },
    };

    let port = u16::try_from(port)
        .map_err(|_| AppError::upstream(format!("Invalid port {port} for service '{}'", service.name)))?;

    Ok(HostTarget {
        primary_host: host,
        failover_host: failover_host.filter(|h| !h.trim().is_empty()),
        port,
        username,
        password_encrypted,
        database: service.database_name.clone(),
    })
}

/// Picks a reachable host for a target.
#[derive(Debug, Clone, Copy)]
pub struct HostResolver {
    probe_timeout: Duration,
}

impl HostResolver {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    /// Probe the primary, then the failover, and return the first that answers.
    ///
    /// # Errors
    ///
    /// Never guesses: if no probe succeeds the error says whether a failover was
    /// configured at all.
    pub async fn effective_host(
        &self,
        target: &HostTarget,
    ) -> Result<EffectiveHost, HostResolutionError> {
        if self.probe(&target.primary_host, target.port).await {
            return Ok(EffectiveHost::Primary(target.primary_host.clone()));
        }

        let Some(failover) = &target.failover_host else {
            tracing::warn!(
                host = %target.primary_host,
                port = target.port,
                "Primary host unreachable, no failover configured"
            );
            return Err(HostResolutionError::PrimaryUnreachableNoFailover);
        };

        tracing::warn!(
            primary = %target.primary_host,
            failover = %failover,
            port = target.port,
            "Primary host unreachable, probing failover"
        );

        if self.probe(failover, target.port).await {
            return Ok(EffectiveHost::Failover(failover.clone()));
        }

        tracing::error!(
            primary = %target.primary_host,
            failover = %failover,
            port = target.port,
            "Both primary and failover hosts unreachable"
        );
        Err(HostResolutionError::BothHostsUnreachable)
    }

    async fn probe(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(%host, port, error = %e, "Host probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(%host, port, "Host probe timed out");
                false
            }
        }
    }
}
