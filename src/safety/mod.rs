//! Read-only guard for registry queries.
//!
//! Parses SQL and classifies each registry entry, so a catalog that would
//! modify the data store is rejected before a run starts.

mod parser;

pub use parser::{classify_sql, SqlClassifier};

use std::fmt;

/// Safety level classification for SQL queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyLevel {
    /// Read-only queries (SELECT, WITH, EXPLAIN, SHOW).
    Safe,
    /// Data modification (INSERT, UPDATE, MERGE).
    Mutating,
    /// Data loss or schema changes (DELETE, DROP, TRUNCATE, ALTER, CREATE, GRANT).
    Destructive,
}

impl SafetyLevel {
    /// Ordering used when combining classifications (higher = more dangerous).
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Self::Safe => 0,
            Self::Mutating => 1,
            Self::Destructive => 2,
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "read-only"),
            Self::Mutating => write!(f, "mutating"),
            Self::Destructive => write!(f, "destructive"),
        }
    }
}

/// The kind of SQL statement detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementType {
    Select,
    With,
    Explain,
    Show,
    Insert,
    Update,
    Delete,
    Merge,
    Ddl,
    Grant,
    /// More than one statement in a single entry.
    Multiple(usize),
    /// Statement could not be parsed or is not recognized.
    Unknown,
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::With => write!(f, "WITH (CTE)"),
            Self::Explain => write!(f, "EXPLAIN"),
            Self::Show => write!(f, "SHOW"),
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Merge => write!(f, "MERGE"),
            Self::Ddl => write!(f, "DDL"),
            Self::Grant => write!(f, "GRANT/REVOKE"),
            Self::Multiple(n) => write!(f, "{n} statements"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of classifying one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The determined safety level.
    pub level: SafetyLevel,
    /// The statement kind that determined the level.
    pub statement_type: StatementType,
    /// Why the entry is not read-only, if it is not.
    pub reason: Option<String>,
}

impl Classification {
    pub fn new(level: SafetyLevel, statement_type: StatementType) -> Self {
        Self {
            level,
            statement_type,
            reason: None,
        }
    }

    pub fn rejected(
        level: SafetyLevel,
        statement_type: StatementType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            level,
            statement_type,
            reason: Some(reason.into()),
        }
    }

    /// Returns true if the entry can run as a read-only extraction.
    pub fn is_read_only(&self) -> bool {
        self.level == SafetyLevel::Safe && self.reason.is_none()
    }
}
