//! Read-only SQL guard.
//!
//! Parses SQL locally and classifies it as read-only, mutating or
//! destructive so that read-only deployments can refuse anything that is
//! not a plain query before it reaches the platform.

mod parser;

pub use parser::{classify_sql, SqlClassifier};

use std::fmt;

/// Safety level classification for SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SafetyLevel {
    /// SELECT, EXPLAIN (without ANALYZE of a write), SHOW.
    ReadOnly,
    /// INSERT, UPDATE, MERGE.
    Mutating,
    /// DELETE, DDL, grants, and anything that could not be classified.
    Destructive,
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::Mutating => write!(f, "mutating"),
            Self::Destructive => write!(f, "destructive"),
        }
    }
}

/// The kind of statement that determined the classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Drop,
    Truncate,
    Alter,
    Create,
    Grant,
    Revoke,
    Explain,
    Show,
    /// Multiple statements; holds the most dangerous one.
    Multiple(Box<StatementType>),
    Unknown,
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select => write!(f, "SELECT"),
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Merge => write!(f, "MERGE"),
            Self::Drop => write!(f, "DROP"),
            Self::Truncate => write!(f, "TRUNCATE"),
            Self::Alter => write!(f, "ALTER"),
            Self::Create => write!(f, "CREATE"),
            Self::Grant => write!(f, "GRANT"),
            Self::Revoke => write!(f, "REVOKE"),
            Self::Explain => write!(f, "EXPLAIN"),
            Self::Show => write!(f, "SHOW"),
            Self::Multiple(inner) => write!(f, "multi-statement {inner}"),
            Self::Unknown => write!(f, "unrecognized"),
        }
    }
}

/// Result of classifying a piece of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: SafetyLevel,
    pub statement_type: StatementType,
    /// Set when the SQL could not be parsed.
    pub parse_error: Option<String>,
}

impl Classification {
    pub fn new(level: SafetyLevel, statement_type: StatementType) -> Self {
        Self {
            level,
            statement_type,
            parse_error: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.level == SafetyLevel::ReadOnly
    }
}
