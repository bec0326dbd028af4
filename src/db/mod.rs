//! Execution source abstraction.
//!
//! Provides a trait-based interface for running query text against the data
//! store, so the pipeline can be driven by PostgreSQL or by a test double.

mod mock;
mod postgres;
mod types;

pub use mock::{FailingDatabaseClient, MockDatabaseClient};
pub use postgres::PostgresClient;
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Opens a pooled PostgreSQL execution source for the given configuration.
///
/// The returned handle is shared by every worker of a run and must be closed
/// by the caller once the run is over.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn DatabaseClient>> {
    let client = PostgresClient::connect(config).await?;
    Ok(Arc::new(client))
}

/// Trait defining the interface for execution sources.
///
/// Implementations must be safe to call concurrently from many workers.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Verifies that a connection can be acquired.
    async fn ping(&self) -> Result<()>;

    /// Executes a SQL query and returns the full table.
    async fn execute_query(&self, sql: &str) -> Result<QueryResult>;

    /// Closes the underlying pool.
    async fn close(&self) -> Result<()>;
}
