//! Mock execution sources for testing.
//!
//! `MockDatabaseClient` answers scripted SQL with tables, failures, panics
//! and delays, and records how many calls ran at once.

use super::{ColumnInfo, DatabaseClient, QueryResult, Value};
use crate::error::{ReportError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the mock does when it receives a given SQL text.
#[derive(Debug, Clone)]
enum Scripted {
    Table(QueryResult),
    Fail(String),
    Panic(String),
}

#[derive(Debug, Clone)]
struct Script {
    response: Scripted,
    delay: Duration,
}

/// A mock execution source that returns predefined results.
#[derive(Debug, Default)]
pub struct MockDatabaseClient {
    scripts: HashMap<String, Script>,
    default_delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockDatabaseClient {
    /// Creates a new mock with no scripted queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `sql` with the given table.
    pub fn with_table(mut self, sql: impl Into<String>, table: QueryResult) -> Self {
        self.script(sql.into(), Scripted::Table(table));
        self
    }

    /// Answers `sql` with a query error carrying `message`.
    pub fn with_failure(mut self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(sql.into(), Scripted::Fail(message.into()));
        self
    }

    /// Panics while executing `sql`.
    pub fn with_panic(mut self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(sql.into(), Scripted::Panic(message.into()));
        self
    }

    /// Delays the answer to `sql` by `delay`.
    pub fn with_delay(mut self, sql: impl Into<String>, delay: Duration) -> Self {
        let default_delay = self.default_delay;
        self.scripts
            .entry(sql.into())
            .or_insert_with(|| Script {
                response: Scripted::Table(QueryResult::new()),
                delay: default_delay,
            })
            .delay = delay;
        self
    }

    /// Delays every answer without an explicit delay by `delay`.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Total number of `execute_query` calls received.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of queries that were executing at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn script(&mut self, sql: String, response: Scripted) {
        let delay = self
            .scripts
            .get(&sql)
            .map(|s| s.delay)
            .unwrap_or(self.default_delay);
        self.scripts.insert(sql, Script { response, delay });
    }

    fn fallback(&self, sql: &str) -> Script {
        // Unscripted SELECTs echo the query back as a one-row table
        let table = if sql.trim_start().to_uppercase().starts_with("SELECT") {
            QueryResult::with_data(
                vec![ColumnInfo::new("result", "text")],
                vec![vec![Value::String(format!("Mock result for: {}", sql.trim()))]],
            )
        } else {
            QueryResult::new()
        };

        Script {
            response: Scripted::Table(table),
            delay: self.default_delay,
        }
    }
}

/// Decrements the in-flight counter even if the call panics.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let script = self
            .scripts
            .get(sql)
            .cloned()
            .unwrap_or_else(|| self.fallback(sql));

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        match script.response {
            Scripted::Table(table) => Ok(table),
            Scripted::Fail(message) => Err(ReportError::query(message)),
            Scripted::Panic(message) => panic!("{message}"),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An execution source that cannot be reached.
#[derive(Debug, Clone)]
pub struct FailingDatabaseClient {
    message: String,
}

impl FailingDatabaseClient {
    /// Creates a source whose every call fails with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl DatabaseClient for FailingDatabaseClient {
    async fn ping(&self) -> Result<()> {
        Err(ReportError::connection(self.message.clone()))
    }

    async fn execute_query(&self, _sql: &str) -> Result<QueryResult> {
        Err(ReportError::connection(self.message.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
