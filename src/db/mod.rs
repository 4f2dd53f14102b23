//! Relational database handle used by the scrape engine.
//!
//! The engine only needs three things from a database: a liveness probe, a
//! way to re-open a handle that was explicitly closed, and query execution
//! returning every cell as text. [`DuckDbPool`] is the production backend.

mod pool;

pub use pool::DuckDbPool;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// The handle was closed and must be reopened before use.
    #[error("database is closed")]
    Closed,

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("driver error: {0}")]
    Driver(#[from] duckdb::Error),

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Result set with every value stringified, in driver delivery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), DbError>;

    async fn reconnect(&self) -> Result<(), DbError>;

    async fn query(&self, sql: &str) -> Result<QueryRows, DbError>;
}
