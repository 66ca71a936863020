//! Application configuration management.
//!
//! Configuration is read from environment variables with the `envy` crate,
//! after an optional `.env` file has been loaded.

use std::time::Duration;

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): metadata store connection string
/// - `CREDENTIAL_SECRET` (required): shared secret the credential vault key is derived from
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `CONSOLIDATED_AUTH_SERVICES` (optional): comma-separated service names governed by
///   the consolidated key strategy; `*` selects every service
/// - `SHADOW_AUTH_SERVICES` (optional): legacy-governed services for which the consolidated
///   strategy is also evaluated in dry-run mode
/// - `REVOKED_KEY_IDENTIFIERS` (optional): identifiers rejected regardless of stored state
/// - `API_KEY_HASH_COST` (optional): bcrypt cost for key hashes, defaults to 12
/// - `RATE_LIMIT_PER_MINUTE` (optional): per-key request budget, 0 disables limiting
/// - `POOL_IDLE_EVICT_SECS` (optional): idle time before an unused target pool is closed
/// - `HOST_PROBE_TIMEOUT_MS` (optional): TCP probe timeout, defaults to 2000
/// - `PROCEDURE_TIMEOUT_SECS` (optional): procedure execution timeout, defaults to 30
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    pub credential_secret: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default)]
    pub consolidated_auth_services: String,

    #[serde(default)]
    pub shadow_auth_services: String,

    #[serde(default)]
    pub revoked_key_identifiers: String,

    #[serde(default = "default_hash_cost")]
    pub api_key_hash_cost: u32,

    #[serde(default)]
    pub rate_limit_per_minute: u64,

    #[serde(default = "default_pool_idle_evict_secs")]
    pub pool_idle_evict_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub host_probe_timeout_ms: u64,

    #[serde(default = "default_procedure_timeout_secs")]
    pub procedure_timeout_secs: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_hash_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

fn default_pool_idle_evict_secs() -> u64 {
    300
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_procedure_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file is loaded first when present.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot be
    /// parsed into its field type.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        // database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    pub fn host_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.host_probe_timeout_ms)
    }

    pub fn procedure_timeout(&self) -> Duration {
        Duration::from_secs(self.procedure_timeout_secs)
    }

    pub fn pool_idle_evict(&self) -> Duration {
        Duration::from_secs(self.pool_idle_evict_secs)
    }

    /// Identifiers listed in `REVOKED_KEY_IDENTIFIERS`.
    pub fn revoked_identifiers(&self) -> Vec<String> {
        split_list(&self.revoked_key_identifiers)
    }
}

/// Split a comma-separated environment value, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
