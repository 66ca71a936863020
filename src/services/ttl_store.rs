//! Expiring key/value state shared by request handling.
//!
//! Holds the revoked-identifier blacklist and rate-limit window counters. The
//! in-memory store is per process; a distributed backend can implement
//! [`TtlStore`] without touching call sites.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

#[async_trait]
pub trait TtlStore: Send + Sync {
    /// Increment the counter at `key`, creating it with `ttl` when absent or
    /// expired, and return the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> u64;

    /// Mark `key` as present, forever when `ttl` is `None`.
    async fn insert(&self, key: &str, ttl: Option<Duration>);

    async fn contains(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTtlStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    ///
    /// Counted inside `retain`, since requests keep inserting while it runs.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }
}

#[async_trait]
impl TtlStore for InMemoryTtlStore {
    async fn incr(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: Some(now + ttl),
        });

        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: Some(now + ttl),
            };
        }

        entry.value += 1;
        entry.value
    }

    async fn insert(&self, key: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value: 1, expires_at });
    }

    async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }
}

/// Key under which a revoked application key identifier is stored.
pub fn revoked_key(identifier: &str) -> String {
    format!("revoked:{identifier}")
}

/// Per-key fixed one-minute window limiter on top of a [`TtlStore`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    per_minute: u64,
}

const WINDOW: Duration = Duration::from_secs(60);

impl RateLimiter {
    /// A limit of 0 disables limiting.
    pub fn new(per_minute: u64) -> Self {
        Self { per_minute }
    }

    pub fn is_enabled(&self) -> bool {
        self.per_minute > 0
    }

    /// Count one request for `subject` and report whether it is within budget.
    pub async fn check(&self, store: &dyn TtlStore, subject: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let count = store.incr(&format!("rate:{subject}"), WINDOW).await;
        count <= self.per_minute
    }
}
