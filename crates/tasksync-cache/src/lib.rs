//! TaskSync Cache - SQLite persistence
//!
//! SQLite-backed storage for:
//! - Entity snapshots (the store the sync engine reads and mutates)
//! - The idempotent operation log
//! - Conflict records awaiting manual resolution
//!
//! ## Architecture
//!
//! This crate implements the `IEntityStore` and `IOperationStore` ports from
//! `tasksync-core`. It is a driven (secondary) adapter in the hexagonal
//! architecture. Every entity write happens inside an operation commit,
//! which runs as a single SQLite transaction.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteSyncRepository`] - Implementation of both storage ports
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use tasksync_cache::{DatabasePool, SqliteSyncRepository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/lib/tasksync/tasksync.db")).await?;
//! let repo = SqliteSyncRepository::new(pool.pool().clone());
//! // Use repo as IEntityStore and IOperationStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteSyncRepository;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be turned back into a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A commit named an operation the log does not hold
    #[error("Operation {0} not found")]
    UnknownOperation(i64),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
