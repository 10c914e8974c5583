//! # linkage-db
//!
//! Durable store for the linkage job orchestrator.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for graphs, processing results and the task queue
//! - An in-memory store implementing the same traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use linkage_db::{Database, GraphRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/linkage").await?;
//!     db.migrate().await?;
//!
//!     let graphs = db.graphs.list_for_user(user_id).await?;
//!     println!("{} graphs", graphs.len());
//!     Ok(())
//! }
//! ```
pub mod graphs;
pub mod memory;
pub mod pool;
pub mod results;
pub mod tasks;

pub mod test_fixtures;

pub use graphs::PgGraphRepository;
pub use memory::MemoryStore;
pub use pool::{connect_pool, PoolConfig};
pub use results::PgResultRepository;
pub use tasks::PgTaskQueue;

// Re-export core traits for convenience
pub use linkage_core::{GraphRepository, ResultRepository, TaskQueue};

use linkage_core::Result;
#[cfg(feature = "migrations")]
use linkage_core::Error;

/// Database handle bundling the PostgreSQL repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub graphs: PgGraphRepository,
    pub results: PgResultRepository,
    pub tasks: std::sync::Arc<PgTaskQueue>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            graphs: PgGraphRepository::new(pool.clone()),
            results: PgResultRepository::new(pool.clone()),
            tasks: std::sync::Arc::new(PgTaskQueue::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
