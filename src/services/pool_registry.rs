//! Keyed registry of target database pools.
//!
//! One pool exists per distinct (host, port, username, password, database).
//! Requests take a [`PoolLease`] for the duration of a call; the lease is
//! released when dropped, on every exit path. Pools with no outstanding leases
//! that stay idle past a threshold are closed by a background sweeper.

use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::time::Instant;

/// Decrypted credentials for one target database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl std::fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Pool identity. The password is kept as a digest so the map key never holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    username: String,
    password_digest: [u8; 32],
    database: String,
}

impl From<&ConnectionSpec> for PoolKey {
    fn from(spec: &ConnectionSpec) -> Self {
        Self {
            host: spec.host.clone(),
            port: spec.port,
            username: spec.username.clone(),
            password_digest: Sha256::digest(spec.password.as_bytes()).into(),
            database: spec.database.clone(),
        }
    }
}

/// Pool sizing applied to every target pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Server-side statement timeout.
    pub statement_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(15),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct PoolSlot {
    pool: PgPool,
    leases: AtomicUsize,
    /// Milliseconds since the registry epoch at which the last lease was dropped.
    last_released_ms: AtomicU64,
}

#[derive(Debug)]
pub struct PoolRegistry {
    slots: DashMap<PoolKey, Arc<PoolSlot>>,
    settings: PoolSettings,
    epoch: Instant,
}

impl PoolRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            slots: DashMap::new(),
            settings,
            epoch: Instant::now(),
        }
    }

    /// Lease the pool for `spec`, creating it on first use.
    ///
    /// Pools connect lazily, so this never blocks on the network; connection
    /// errors surface when the lease is first used.
    pub fn acquire(&self, spec: &ConnectionSpec) -> PoolLease {
        let key = PoolKey::from(spec);

        // The shard lock is held while the lease count is bumped, so eviction
        // cannot remove a slot between lookup and lease.
        let slot = {
            let entry = self.slots.entry(key).or_insert_with(|| {
                tracing::info!(
                    host = %spec.host,
                    port = spec.port,
                    database = %spec.database,
                    "Creating target database pool"
                );
                Arc::new(PoolSlot {
                    pool: self.build_pool(spec),
                    leases: AtomicUsize::new(0),
                    last_released_ms: AtomicU64::new(self.now_ms()),
                })
            });
            entry.leases.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };

        PoolLease {
            slot,
            epoch: self.epoch,
        }
    }

    /// Close pools with no leases that have been idle for at least `max_idle`.
    ///
    /// Returns the number of pools evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.now_ms();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let mut evicted = Vec::new();

        self.slots.retain(|_, slot| {
            let idle_for = now.saturating_sub(slot.last_released_ms.load(Ordering::SeqCst));
            let evict = slot.leases.load(Ordering::SeqCst) == 0 && idle_for >= max_idle_ms;
            if evict {
                evicted.push(slot.pool.clone());
            }
            !evict
        });

        let count = evicted.len();
        for pool in evicted {
            tokio::spawn(async move { pool.close().await });
        }
        if count > 0 {
            tracing::info!(evicted = count, remaining = self.len(), "Evicted idle target pools");
        }
        count
    }

    /// Periodically evict idle pools until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, max_idle: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = (max_idle / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.evict_idle(max_idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn build_pool(&self, spec: &ConnectionSpec) -> PgPool {
        let statement_timeout_ms = self.settings.statement_timeout.as_millis().to_string();
        let options = PgConnectOptions::new()
            .host(&spec.host)
            .port(spec.port)
            .username(&spec.username)
            .password(&spec.password)
            .database(&spec.database)
            .options([("statement_timeout", statement_timeout_ms)]);

        PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .min_connections(self.settings.min_connections)
            .idle_timeout(Some(self.settings.idle_timeout))
            .acquire_timeout(self.settings.acquire_timeout)
            .connect_lazy_with(options)
    }

    fn now_ms(&self) -> u64 {
        elapsed_ms(self.epoch)
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Scoped use of a registry pool. Dropping it releases the lease.
#[derive(Debug)]
pub struct PoolLease {
    slot: Arc<PoolSlot>,
    epoch: Instant,
}

impl Deref for PoolLease {
    type Target = PgPool;

    fn deref(&self) -> &PgPool {
        &self.slot.pool
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        // Timestamp before the count drops so a sweeper never sees a released
        // slot with a stale release time.
        self.slot
            .last_released_ms
            .store(elapsed_ms(self.epoch), Ordering::SeqCst);
        self.slot.leases.fetch_sub(1, Ordering::SeqCst);
    }
}
