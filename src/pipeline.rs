//! Pipeline driver.
//!
//! Composes one run: check the execution source, create the period folder,
//! execute every query, write one artifact per successful result and
//! summarize what succeeded and what failed.
//!
//! ```text
//! Init -> FolderReady -> Executing -> Writing -> Done
//!   |          |
//!   +----------+--> Failed
//! ```

use crate::db::DatabaseClient;
use crate::error::{ReportError, Result};
use crate::executor::{execute_all, ExecutorOptions, QueryOutcome};
use crate::period::ReportingPeriod;
use crate::registry::QueryRegistry;
use crate::writer::{self, ArtifactWriter};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    FolderReady,
    Executing,
    Writing,
    Done,
    Failed,
}

/// Phase in which a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Execution,
    Write,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub stage: FailureStage,
    pub message: String,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every task produced an artifact.
    Success,
    /// Some tasks failed, at least one artifact was written.
    Partial,
    /// Tasks failed and no artifact was written.
    Failed,
}

/// What a run produced and what it could not.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub period: ReportingPeriod,
    /// Period folder the artifacts were written to.
    pub folder: PathBuf,
    /// Tasks whose artifact was written, in registry order.
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, TaskFailure>,
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunSummary {
    pub fn new(period: ReportingPeriod, folder: PathBuf) -> Self {
        Self {
            period,
            folder,
            succeeded: Vec::new(),
            failed: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.failed.is_empty() {
            RunStatus::Success
        } else if self.artifacts.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    fn record_artifact(&mut self, name: &str, path: PathBuf) {
        self.succeeded.push(name.to_string());
        self.artifacts.insert(name.to_string(), path);
    }

    fn record_failure(&mut self, name: &str, stage: FailureStage, error: &ReportError) {
        self.failed.insert(
            name.to_string(),
            TaskFailure {
                stage,
                message: error.to_string(),
            },
        );
    }

    /// Human-readable report for the terminal.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Period {} -> {}",
            self.period.label(),
            self.folder.display()
        );
        for name in &self.succeeded {
            if let Some(path) = self.artifacts.get(name) {
                let _ = writeln!(out, "  ok    {name} -> {}", path.display());
            }
        }
        for (name, failure) in &self.failed {
            let _ = writeln!(
                out,
                "  FAIL  {name} [{}]: {}",
                failure.stage, failure.message
            );
        }
        let _ = write!(
            out,
            "{} succeeded, {} failed in {:.2}s",
            self.succeeded.len(),
            self.failed.len(),
            self.elapsed.as_secs_f64()
        );
        out
    }
}

/// Runs registries against one execution source and one output root.
pub struct Pipeline {
    source: Arc<dyn DatabaseClient>,
    writer: ArtifactWriter,
    options: ExecutorOptions,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn DatabaseClient>,
        writer: ArtifactWriter,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            source,
            writer,
            options,
            state: PipelineState::Init,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: ReportError) -> ReportError {
        error!("Run aborted: {err}");
        self.transition(PipelineState::Failed);
        err
    }

    /// Runs every task of `registry` for `period`.
    ///
    /// Returns `Err` only when the run cannot start: the execution source is
    /// unreachable or the period folder cannot be created. Per-task failures
    /// are reported in the summary.
    pub async fn run(
        &mut self,
        registry: &QueryRegistry,
        period: &ReportingPeriod,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        self.state = PipelineState::Init;

        if let Err(e) = self.source.ping().await {
            return Err(self.fail(ReportError::setup(format!(
                "Execution source unavailable: {e}"
            ))));
        }

        let folder = match self.writer.ensure_period_dir(period) {
            Ok(folder) => folder,
            Err(e) => return Err(self.fail(e)),
        };
        self.transition(PipelineState::FolderReady);
        info!("Reporting period {period} -> {}", folder.display());

        let mut summary = RunSummary::new(*period, folder);

        self.transition(PipelineState::Executing);
        let outcomes = execute_all(registry.tasks(), self.source.clone(), &self.options).await;
        debug!(order = ?outcomes.completion_order(), "Queries finished");

        self.transition(PipelineState::Writing);
        for outcome in outcomes.into_outcomes() {
            if let Some(e) = outcome.error() {
                summary.record_failure(&outcome.name, FailureStage::Execution, e);
                continue;
            }

            let (outcome, artifact) = self.write_outcome(outcome, period).await;
            if let Some(path) = artifact {
                summary.record_artifact(&outcome.name, path);
            } else if let Some(e) = outcome.error() {
                warn!(query = %outcome.name, "Artifact not written: {e}");
                summary.record_failure(&outcome.name, FailureStage::Write, e);
            }
        }

        self.transition(PipelineState::Done);
        summary.elapsed = start.elapsed();
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "Run finished in {:.2}s",
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// Writes one outcome on the blocking pool. A failed write degrades the outcome.
    async fn write_outcome(
        &self,
        outcome: QueryOutcome,
        period: &ReportingPeriod,
    ) -> (QueryOutcome, Option<PathBuf>) {
        let name = outcome.name.clone();
        let root = self.writer.root().to_path_buf();
        let period = *period;

        let joined = tokio::task::spawn_blocking(move || {
            let written = writer::write(&outcome, &period, &root);
            (outcome, written)
        })
        .await;

        match joined {
            Ok((outcome, Ok(path))) => (outcome, Some(path)),
            Ok((mut outcome, Err(e))) => {
                outcome.degrade(e);
                (outcome, None)
            }
            Err(e) => (
                QueryOutcome::failure(
                    name,
                    ReportError::internal(format!("writer task failed: {e}")),
                    Duration::ZERO,
                ),
                None,
            ),
        }
    }
}
