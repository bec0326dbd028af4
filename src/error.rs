//! Error types for monthly-extract.
//!
//! Defines the main error enum used throughout the pipeline. Fatal variants
//! abort a run before any query starts; the rest are captured per task and
//! surfaced in the run summary.

use std::time::Duration;
use thiserror::Error;

/// Main error type for extraction runs.
#[derive(Error, Debug)]
pub enum ReportError {
    /// Database connection errors (host unreachable, auth failed, pool exhausted, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Run setup errors (execution source unavailable, output folder not creatable)
    #[error("Setup error: {0}")]
    Setup(String),

    /// Query execution errors (syntax errors, dropped connections, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// A query exceeded the per-task time limit.
    #[error("Query timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    /// A successful result could not be written as an artifact.
    #[error("Artifact write error: {0}")]
    ArtifactWrite(String),

    /// The reporting period could not be computed from the given offset.
    #[error("Invalid month offset: {0}")]
    InvalidOffset(String),

    /// Configuration errors (invalid config file, bad query registry, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (worker lost, unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReportError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a setup error with the given message.
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates an artifact write error with the given message.
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::ArtifactWrite(msg.into())
    }

    /// Creates an invalid offset error with the given message.
    pub fn invalid_offset(msg: impl Into<String>) -> Self {
        Self::InvalidOffset(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Setup(_) => "Setup Error",
            Self::Query(_) => "Query Error",
            Self::Timeout(_) => "Timeout",
            Self::ArtifactWrite(_) => "Artifact Write Error",
            Self::InvalidOffset(_) => "Invalid Offset",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true if this error aborts the whole run rather than a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Setup(_) | Self::InvalidOffset(_) | Self::Config(_)
        )
    }
}

/// Result type alias using ReportError.
pub type Result<T> = std::result::Result<T, ReportError>;
