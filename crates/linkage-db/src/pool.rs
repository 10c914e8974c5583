//! PostgreSQL pool setup for the worker.
//!
//! A running clustering task holds up to two connections at once, one for
//! the progress mailbox and one for the stage itself (result inserts and
//! queue updates). [`PoolConfig::sized_for_workers`] derives the pool
//! size from the worker's concurrency so a full batch never waits on
//! `acquire`.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use linkage_core::{Error, Result};

/// Connections reserved for the claim loop and submissions.
const RESERVED_CONNECTIONS: u32 = 2;

/// Connections a single running task may hold.
const CONNECTIONS_PER_TASK: u32 = 2;

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Idle connections are closed after this long. Clustering runs for
    /// hours, so connections opened for a burst of imports are released.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// | Variable | Default |
    /// |----------|---------|
    /// | `LINKAGE_DB_MAX_CONNECTIONS` | `10` |
    /// | `LINKAGE_DB_ACQUIRE_TIMEOUT_SECS` | `30` |
    /// | `LINKAGE_DB_IDLE_TIMEOUT_SECS` | `600` |
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        let defaults = Self::default();
        Self {
            max_connections: var("LINKAGE_DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            min_connections: defaults.min_connections,
            acquire_timeout: var("LINKAGE_DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: var("LINKAGE_DB_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
        }
    }

    /// Raise `max_connections` so `concurrent_tasks` tasks can run at once.
    /// A larger configured value is kept.
    pub fn sized_for_workers(mut self, concurrent_tasks: usize) -> Self {
        let tasks = u32::try_from(concurrent_tasks).unwrap_or(u32::MAX);
        let needed = tasks
            .saturating_mul(CONNECTIONS_PER_TASK)
            .saturating_add(RESERVED_CONNECTIONS);
        self.max_connections = self.max_connections.max(needed);
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Open a pool and wait for the first connection.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}
