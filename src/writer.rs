//! Artifact writer.
//!
//! Serializes one query result into one standalone `.xlsx` workbook inside
//! the period folder. Files are staged under a hidden name and renamed over
//! the target, so re-running a period overwrites instead of duplicating.

use crate::db::{QueryResult, Value};
use crate::error::{ReportError, Result};
use crate::executor::QueryOutcome;
use crate::period::{ReportingPeriod, ILLEGAL_PATH_CHARS};
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File extension of every artifact.
pub const ARTIFACT_EXTENSION: &str = "xlsx";

/// Excel's worksheet name limit.
const MAX_SHEET_NAME_CHARS: usize = 31;

/// Characters Excel rejects in worksheet names.
const ILLEGAL_SHEET_CHARS: &[char] = &['[', ']', ':', '*', '?', '/', '\\'];

/// Largest integer magnitude an f64 cell holds exactly.
const MAX_EXACT_INT: u64 = 1 << 53;

/// Replaces filesystem-illegal characters with `-`, keeping everything else.
///
/// Spaces, accents and punctuation survive so the file name stays
/// recognisable as the query name.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_control() || ILLEGAL_PATH_CHARS.contains(&c) {
                '-'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_end_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Derives a valid worksheet name from an artifact name.
pub fn sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !ILLEGAL_SHEET_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'');
    let truncated: String = cleaned.chars().take(MAX_SHEET_NAME_CHARS).collect();
    let truncated = truncated.trim_end_matches('\'').trim_end();

    if truncated.is_empty() {
        "Sheet1".to_string()
    } else {
        truncated.to_string()
    }
}

/// Writes query results below a root directory, one folder per period.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding every artifact of `period`.
    pub fn period_dir(&self, period: &ReportingPeriod) -> PathBuf {
        self.root.join(period.folder_name())
    }

    /// Creates the period folder if absent. Safe to call repeatedly.
    pub fn ensure_period_dir(&self, period: &ReportingPeriod) -> Result<PathBuf> {
        let dir = self.period_dir(period);
        fs::create_dir_all(&dir).map_err(|e| {
            ReportError::setup(format!(
                "Cannot create output folder {}: {e}",
                dir.display()
            ))
        })?;
        Ok(dir)
    }

    /// Target path for the artifact of query `name`.
    pub fn artifact_path(&self, name: &str, period: &ReportingPeriod) -> PathBuf {
        self.period_dir(period).join(format!(
            "{}_{}.{}",
            sanitize_name(name),
            period.label(),
            ARTIFACT_EXTENSION
        ))
    }

    /// Writes `table` as the artifact of query `name`, replacing any previous one.
    pub fn write_table(
        &self,
        name: &str,
        table: &QueryResult,
        period: &ReportingPeriod,
    ) -> Result<PathBuf> {
        let dir = self.period_dir(period);
        if !dir.is_dir() {
            return Err(ReportError::artifact(format!(
                "Output folder {} does not exist",
                dir.display()
            )));
        }
        if !table.is_rectangular() {
            return Err(ReportError::artifact(format!(
                "Result of '{name}' has rows that do not match its {} columns",
                table.columns.len()
            )));
        }

        let mut workbook = build_workbook(name, table)?;

        let path = self.artifact_path(name, period);
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = dir.join(format!(".{file_name}.partial"));

        if let Err(e) = workbook.save(&staging) {
            discard(&staging);
            return Err(ReportError::artifact(format!(
                "Cannot write {}: {e}",
                path.display()
            )));
        }
        if let Err(e) = fs::rename(&staging, &path) {
            discard(&staging);
            return Err(ReportError::artifact(format!(
                "Cannot replace {}: {e}",
                path.display()
            )));
        }

        debug!(rows = table.row_count(), "Wrote {}", path.display());
        Ok(path)
    }
}

/// Writes a successful outcome's table to its artifact path under `root`.
pub fn write(outcome: &QueryOutcome, period: &ReportingPeriod, root: &Path) -> Result<PathBuf> {
    let table = outcome.table().ok_or_else(|| {
        ReportError::internal(format!("Query '{}' has no result to write", outcome.name))
    })?;
    ArtifactWriter::new(root).write_table(&outcome.name, table, period)
}

fn discard(staging: &Path) {
    if staging.exists() {
        if let Err(e) = fs::remove_file(staging) {
            warn!("Could not remove {}: {e}", staging.display());
        }
    }
}

fn xlsx_error(name: &str) -> impl Fn(XlsxError) -> ReportError + '_ {
    move |e| ReportError::artifact(format!("Cannot serialize '{name}': {e}"))
}

/// Builds a single-sheet workbook: a header row, then one row per record.
fn build_workbook(name: &str, table: &QueryResult) -> Result<Workbook> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name(name)).map_err(xlsx_error(name))?;

    for (index, column) in table.columns.iter().enumerate() {
        let col = column_index(name, index)?;
        sheet
            .write_string(0, col, &column.name)
            .map_err(xlsx_error(name))?;
    }

    for (r, row) in table.rows.iter().enumerate() {
        let row_index = u32::try_from(r + 1).map_err(|_| {
            ReportError::artifact(format!("Result of '{name}' has too many rows"))
        })?;
        for (index, value) in row.iter().enumerate() {
            let col = column_index(name, index)?;
            write_cell(sheet, row_index, col, value).map_err(|e| match e {
                CellError::Xlsx(e) => xlsx_error(name)(e),
                CellError::Unsupported(kind) => ReportError::artifact(format!(
                    "Column '{}' of '{name}' holds a {kind} value, which cannot be written to a cell",
                    table.columns[index].name
                )),
            })?;
        }
    }

    Ok(workbook)
}

fn column_index(name: &str, index: usize) -> Result<u16> {
    u16::try_from(index)
        .map_err(|_| ReportError::artifact(format!("Result of '{name}' has too many columns")))
}

enum CellError {
    Xlsx(XlsxError),
    Unsupported(&'static str),
}

impl From<XlsxError> for CellError {
    fn from(e: XlsxError) -> Self {
        Self::Xlsx(e)
    }
}

fn write_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &Value,
) -> std::result::Result<(), CellError> {
    if value.is_nested() {
        let kind = match value {
            Value::Json(_) => "nested JSON",
            other => other.kind(),
        };
        return Err(CellError::Unsupported(kind));
    }

    match value {
        Value::Null => {}
        Value::Bool(b) => {
            sheet.write_boolean(row, col, *b)?;
        }
        Value::Int(i) if i.unsigned_abs() <= MAX_EXACT_INT => {
            sheet.write_number(row, col, *i as f64)?;
        }
        Value::Int(i) => {
            sheet.write_string(row, col, i.to_string())?;
        }
        Value::Float(f) if f.is_finite() => {
            sheet.write_number(row, col, *f)?;
        }
        Value::Float(f) => {
            sheet.write_string(row, col, f.to_string())?;
        }
        Value::String(s) => {
            sheet.write_string(row, col, s)?;
        }
        Value::Json(json) => match json {
            serde_json::Value::Null => {}
            serde_json::Value::Bool(b) => {
                sheet.write_boolean(row, col, *b)?;
            }
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => {
                    sheet.write_number(row, col, f)?;
                }
                None => {
                    sheet.write_string(row, col, n.to_string())?;
                }
            },
            serde_json::Value::String(s) => {
                sheet.write_string(row, col, s)?;
            }
            // Rejected above as nested
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {}
        },
        Value::Bytes(_) | Value::Array(_) => return Err(CellError::Unsupported(value.kind())),
    }
    Ok(())
}
