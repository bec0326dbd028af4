//! System check run by the `check` command.
//!
//! Verifies everything a run depends on without executing any query: the
//! resolved period and its folder, write access to that folder, the query
//! registry, and the execution source.

use crate::db::DatabaseClient;
use crate::error::Result;
use crate::period::ReportingPeriod;
use crate::registry::QueryRegistry;
use crate::writer::ArtifactWriter;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

const WRITE_CHECK_FILE: &str = ".monthly-extract-write-check.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

impl CheckStatus {
    fn marker(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        }
    }
}

/// One line of the check report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckItem {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub period: ReportingPeriod,
    pub folder: PathBuf,
    pub items: Vec<CheckItem>,
}

impl PreflightReport {
    pub fn new(period: ReportingPeriod, folder: PathBuf) -> Self {
        Self {
            period,
            folder,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: CheckItem) {
        self.items.push(item);
    }

    /// True when no check failed. Warnings do not fail the report.
    pub fn passed(&self) -> bool {
        self.items.iter().all(|i| i.status != CheckStatus::Fail)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Reporting period: {}", self.period.label());
        let _ = writeln!(out, "Period folder:    {}", self.folder.display());
        for item in &self.items {
            let _ = writeln!(
                out,
                "  {:<5} {:<10} {}",
                item.status.marker(),
                item.name,
                item.detail
            );
        }
        let verdict = if self.passed() {
            "All checks passed"
        } else {
            "Some checks failed"
        };
        let _ = write!(out, "{verdict}");
        out
    }
}

/// Creates the period folder and writes then removes a scratch file in it.
pub fn check_output_folder(writer: &ArtifactWriter, period: &ReportingPeriod) -> CheckItem {
    let existed = writer.period_dir(period).is_dir();

    let dir = match writer.ensure_period_dir(period) {
        Ok(dir) => dir,
        Err(e) => return CheckItem::new("folder", CheckStatus::Fail, e.to_string()),
    };

    let scratch = dir.join(WRITE_CHECK_FILE);
    let written = fs::write(&scratch, b"ok").and_then(|_| fs::remove_file(&scratch));
    match written {
        Ok(()) if existed => CheckItem::new("folder", CheckStatus::Ok, "exists and is writable"),
        Ok(()) => CheckItem::new("folder", CheckStatus::Ok, "created and writable"),
        Err(e) => CheckItem::new(
            "folder",
            CheckStatus::Fail,
            format!("cannot write to {}: {e}", dir.display()),
        ),
    }
}

/// Reports how many queries were loaded and whether they are all read-only.
pub fn check_registry(registry: &Result<QueryRegistry>, enforce_read_only: bool) -> CheckItem {
    let registry = match registry {
        Ok(registry) => registry,
        Err(e) => return CheckItem::new("queries", CheckStatus::Fail, e.to_string()),
    };

    if registry.is_empty() {
        return CheckItem::new("queries", CheckStatus::Warn, "registry is empty");
    }

    match registry.ensure_read_only() {
        Ok(()) => CheckItem::new(
            "queries",
            CheckStatus::Ok,
            format!("{} read-only queries", registry.len()),
        ),
        Err(e) if enforce_read_only => CheckItem::new("queries", CheckStatus::Fail, e.to_string()),
        Err(e) => CheckItem::new(
            "queries",
            CheckStatus::Warn,
            format!("{} queries, guard disabled: {e}", registry.len()),
        ),
    }
}

/// Pings the execution source.
pub async fn check_source(source: &Result<std::sync::Arc<dyn DatabaseClient>>) -> CheckItem {
    let source = match source {
        Ok(source) => source,
        Err(e) => return CheckItem::new("database", CheckStatus::Fail, e.to_string()),
    };
    match source.ping().await {
        Ok(()) => CheckItem::new("database", CheckStatus::Ok, "reachable"),
        Err(e) => CheckItem::new("database", CheckStatus::Fail, e.to_string()),
    }
}
