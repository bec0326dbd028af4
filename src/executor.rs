//! Parallel query executor.
//!
//! Runs every task of a registry against one execution source with a bounded
//! number of concurrent workers. Each task produces exactly one outcome; a
//! failure, timeout or panic in one task never affects the others.

use crate::db::{DatabaseClient, QueryResult};
use crate::error::ReportError;
use crate::registry::QueryTask;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Worker count used when none is configured.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Concurrency and time limits for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Upper bound on tasks executing at the same time.
    pub max_workers: usize,
    /// Per-task time limit. `None` waits indefinitely.
    pub task_timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            task_timeout: None,
        }
    }
}

impl ExecutorOptions {
    pub fn new(max_workers: usize, task_timeout: Option<Duration>) -> Self {
        Self {
            max_workers: max_workers.max(1),
            task_timeout,
        }
    }

    /// Effective worker count, never zero.
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }
}

/// The result of running one task.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Name of the task this outcome belongs to.
    pub name: String,
    pub result: Result<QueryResult, ReportError>,
    /// Time spent executing, excluding time waiting for a worker.
    pub elapsed: Duration,
}

impl QueryOutcome {
    pub fn success(name: impl Into<String>, table: QueryResult, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            result: Ok(table),
            elapsed,
        }
    }

    pub fn failure(name: impl Into<String>, error: ReportError, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            result: Err(error),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn table(&self) -> Option<&QueryResult> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ReportError> {
        self.result.as_ref().err()
    }

    /// Drops the table and records `error` in its place.
    pub fn degrade(&mut self, error: ReportError) {
        self.result = Err(error);
    }
}

/// One outcome per task, in task order.
#[derive(Debug, Default)]
pub struct OutcomeSet {
    outcomes: Vec<QueryOutcome>,
    completion_order: Vec<String>,
}

impl OutcomeSet {
    /// Looks up the outcome of the task called `name`.
    pub fn get(&self, name: &str) -> Option<&QueryOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryOutcome> {
        self.outcomes.iter()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Task names in the order their outcomes arrived.
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    pub fn into_outcomes(self) -> Vec<QueryOutcome> {
        self.outcomes
    }
}

/// Executes every task against `source`, at most `options.workers()` at a time.
///
/// Returns after all tasks have completed. The returned set has exactly one
/// outcome per task, in the same order as `tasks`.
pub async fn execute_all(
    tasks: &[QueryTask],
    source: Arc<dyn DatabaseClient>,
    options: &ExecutorOptions,
) -> OutcomeSet {
    let workers = options.workers();
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();

    info!(tasks = tasks.len(), workers, "Executing queries");

    for (index, task) in tasks.iter().enumerate() {
        let semaphore = semaphore.clone();
        let source = source.clone();
        let task = task.clone();
        let timeout = options.task_timeout;

        running.spawn(async move {
            let outcome = run_task(&task, source, semaphore, timeout).await;
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<QueryOutcome>> = tasks.iter().map(|_| None).collect();
    let mut completion_order = Vec::with_capacity(tasks.len());

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                completion_order.push(outcome.name.clone());
                slots[index] = Some(outcome);
            }
            Err(e) => warn!("Query worker was lost: {e}"),
        }
    }

    let outcomes = slots
        .into_iter()
        .zip(tasks)
        .map(|(slot, task)| {
            slot.unwrap_or_else(|| {
                completion_order.push(task.name.clone());
                QueryOutcome::failure(
                    &task.name,
                    ReportError::internal("worker ended without reporting an outcome"),
                    Duration::ZERO,
                )
            })
        })
        .collect();

    OutcomeSet {
        outcomes,
        completion_order,
    }
}

async fn run_task(
    task: &QueryTask,
    source: Arc<dyn DatabaseClient>,
    semaphore: Arc<Semaphore>,
    timeout: Option<Duration>,
) -> QueryOutcome {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return QueryOutcome::failure(
                &task.name,
                ReportError::internal("worker pool closed"),
                Duration::ZERO,
            )
        }
    };

    debug!(query = %task.name, "Query started");
    let start = Instant::now();

    let work = AssertUnwindSafe(source.execute_query(&task.sql)).catch_unwind();
    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(caught) => caught,
            Err(_) => Ok(Err(ReportError::Timeout(limit))),
        },
        None => work.await,
    };
    let result = caught.unwrap_or_else(|payload| {
        Err(ReportError::internal(format!(
            "query worker panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    let elapsed = start.elapsed();
    match &result {
        Ok(table) => info!(
            query = %task.name,
            rows = table.row_count(),
            "Query finished in {:.2}s",
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!(
            query = %task.name,
            "Query failed after {:.2}s: {e}",
            elapsed.as_secs_f64()
        ),
    }

    QueryOutcome {
        name: task.name.clone(),
        result,
        elapsed,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
