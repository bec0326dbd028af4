//! Query registry.
//!
//! An explicitly constructed, immutable, ordered catalog of named queries.
//! It is loaded once before a run and handed to the pipeline as a value.

use crate::error::{ReportError, Result};
use crate::safety::{classify_sql, Classification};
use crate::writer::sanitize_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One named query; its result becomes one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTask {
    /// Human-readable artifact name, unique within a registry.
    pub name: String,
    /// Query source.
    pub sql: String,
}

impl QueryTask {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Position of a task inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

/// On-disk registry format: an array of `[[query]]` tables.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "query")]
    queries: Vec<QueryTask>,
}

/// Ordered, validated catalog of query tasks.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    tasks: Vec<QueryTask>,
}

impl QueryRegistry {
    /// Builds a registry, checking that names and artifact paths are unique.
    pub fn new(tasks: Vec<QueryTask>) -> Result<Self> {
        Self::validate(&tasks)?;
        Ok(Self { tasks })
    }

    fn validate(tasks: &[QueryTask]) -> Result<()> {
        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut artifact_names: HashMap<String, &str> = HashMap::new();

        for (index, task) in tasks.iter().enumerate() {
            let name = task.name.trim();
            if name.is_empty() {
                return Err(ReportError::config(format!(
                    "Query #{} has an empty name",
                    index + 1
                )));
            }
            if task.sql.trim().is_empty() {
                return Err(ReportError::config(format!(
                    "Query '{}' has no SQL",
                    task.name
                )));
            }
            if names.insert(task.name.as_str(), index).is_some() {
                return Err(ReportError::config(format!(
                    "Query name '{}' appears more than once",
                    task.name
                )));
            }
            // Two names that sanitize alike would overwrite each other's artifact
            if let Some(other) = artifact_names.insert(sanitize_name(&task.name), &task.name) {
                return Err(ReportError::config(format!(
                    "Queries '{}' and '{}' would write to the same artifact",
                    other, task.name
                )));
            }
        }

        Ok(())
    }

    /// Loads a registry from a TOML file of `[[query]]` entries.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReportError::config(format!(
                "Failed to read query registry {}: {e}",
                path.display()
            ))
        })?;

        let registry = Self::parse_toml(&content).map_err(|e| match e {
            ReportError::Config(msg) => {
                ReportError::config(format!("{msg} (in {})", path.display()))
            }
            other => other,
        })?;
        debug!(
            "Loaded {} queries from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parses a registry from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| ReportError::config(format!("Invalid query registry: {e}")))?;
        Self::new(file.queries)
    }

    /// Tasks in registry order.
    pub fn tasks(&self) -> &[QueryTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolves a task name to its id.
    pub fn id_of(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().position(|t| t.name == name).map(TaskId)
    }

    /// Returns the task with the given id.
    pub fn get(&self, id: TaskId) -> Option<&QueryTask> {
        self.tasks.get(id.0)
    }

    /// Restricts the registry to `names`, keeping registry order.
    ///
    /// Every name is resolved up front; an unknown name fails before any
    /// query runs.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut ids = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.id_of(name).ok_or_else(|| {
                    ReportError::config(format!("Unknown query '{name}' in selection"))
                })
            })
            .collect::<Result<Vec<TaskId>>>()?;
        ids.sort_unstable();
        ids.dedup();

        Ok(Self {
            tasks: ids
                .into_iter()
                .filter_map(|id| self.get(id).cloned())
                .collect(),
        })
    }

    /// Classifies every query's SQL.
    pub fn classify(&self) -> Vec<(&QueryTask, Classification)> {
        self.tasks
            .iter()
            .map(|task| (task, classify_sql(&task.sql)))
            .collect()
    }

    /// Fails if any query is not a single read-only statement.
    pub fn ensure_read_only(&self) -> Result<()> {
        let rejected: Vec<String> = self
            .classify()
            .into_iter()
            .filter(|(_, c)| !c.is_read_only())
            .map(|(task, c)| {
                format!(
                    "'{}': {}",
                    task.name,
                    c.reason.unwrap_or_else(|| c.level.to_string())
                )
            })
            .collect();

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(ReportError::config(format!(
                "Query registry contains statements that are not read-only:\n  {}",
                rejected.join("\n  ")
            )))
        }
    }
}
