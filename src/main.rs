//! Mirabel Procedure Gateway - Main Application Entry Point
//!
//! An HTTP gateway that lets registered applications call stored procedures on
//! backend databases. Each call is gated by an API key, scoped by role
//! permissions, routed to a reachable host and recorded for auditing.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx for both metadata and target databases
//! - **Authentication**: API keys, bcrypt-hashed `identifier.secret` or legacy/endpoint keys
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create metadata database pool and run migrations
//! 3. Seed revoked key identifiers and start background maintenance
//! 4. Build HTTP router with routes and middleware
//! 5. Start server on configured port
//!
//! The binary also carries a few operator commands (key issuance, password
//! sealing) that share the same configuration.

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod state;

#[cfg(test)]
mod test_support;

use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    config::Config,
    services::{
        authorization::{Authorizer, StrategyPolicy},
        directory::{MetadataStore, PgMetadataStore},
        host_resolver::HostResolver,
        key_issuer::ApiKeyIssuer,
        pool_registry::{PoolRegistry, PoolSettings},
        procedure_executor::PgProcedureExecutor,
        ttl_store::{InMemoryTtlStore, RateLimiter, TtlStore, revoked_key},
        usage_recorder::{PgUsageSink, UsageRecorder},
        vault::CredentialVault,
    },
    state::AppState,
};

#[derive(Parser, Debug)]
#[command(name = "mirabel-gateway", about = "Stored procedure gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Issue a new key for a public endpoint, deactivating its current key
    IssueEndpointKey {
        endpoint_id: Uuid,
    },

    /// Generate an application key and the hash to store for it
    GenerateApplicationKey,

    /// Encrypt a datastore password for storage, leaving ciphertext untouched
    SealPassword {
        value: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::IssueEndpointKey { endpoint_id } => {
            let pool = db::create_pool(&config.database_url).await?;
            let store = PgMetadataStore::new(pool);
            let key = ApiKeyIssuer::new(config.api_key_hash_cost)
                .issue_endpoint_key(&store, endpoint_id)
                .await?;
            println!("{key}");
            Ok(())
        }
        Command::GenerateApplicationKey => {
            let issuer = ApiKeyIssuer::new(config.api_key_hash_cost);
            let key = issuer.generate();
            let hash = issuer.hash_key(&key.full_key()).await?;
            println!("api_key_identifier: {}", key.identifier);
            println!("api_key_hash:       {hash}");
            println!("api key (shown once): {}", key.full_key());
            Ok(())
        }
        Command::SealPassword { value } => {
            println!("{}", CredentialVault::new(&config.credential_secret).seal_if_plain(&value));
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn MetadataStore> = Arc::new(PgMetadataStore::new(pool.clone()));

    let ttl = Arc::new(InMemoryTtlStore::new());
    let revoked = config.revoked_identifiers();
    for identifier in &revoked {
        ttl.insert(&revoked_key(identifier), None).await;
    }
    if !revoked.is_empty() {
        tracing::info!(count = revoked.len(), "Revoked key identifiers loaded");
    }
    spawn_ttl_purge(Arc::clone(&ttl));

    let registry = Arc::new(PoolRegistry::new(PoolSettings {
        statement_timeout: config.procedure_timeout(),
        ..PoolSettings::default()
    }));
    registry.spawn_sweeper(config.pool_idle_evict());

    let authorizer = Authorizer::new(
        Arc::clone(&store),
        ttl,
        ApiKeyIssuer::new(config.api_key_hash_cost),
        RateLimiter::new(config.rate_limit_per_minute),
        StrategyPolicy::from_config(&config),
    );

    let state = AppState {
        store,
        authorizer,
        vault: Arc::new(CredentialVault::new(&config.credential_secret)),
        host_resolver: HostResolver::new(config.host_probe_timeout()),
        runner: Arc::new(PgProcedureExecutor::new(registry, config.procedure_timeout())),
        usage: UsageRecorder::new(Arc::new(PgUsageSink::new(pool))),
    };

    let app = handlers::router(state);

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Drop expired rate-limit windows once a minute.
fn spawn_ttl_purge(ttl: Arc<InMemoryTtlStore>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let purged = ttl.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired TTL entries");
            }
        }
    });
}
