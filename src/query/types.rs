//! Query lifecycle types: state machine, handles, results and polling policy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Pending,
    Running,
    Success,
    Failed,
    Stopped,
    TimedOut,
}

impl QueryState {
    /// SUCCESS, FAILED, STOPPED and TIMED_OUT are never left.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    pub fn can_transition_to(&self, next: QueryState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Maps a platform status string; unknown values count as pending.
    pub fn parse_platform(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" | "started" | "fetching" => Self::Running,
            "success" | "completed" => Self::Success,
            "failed" | "error" => Self::Failed,
            "stopped" | "cancelled" | "canceled" => Self::Stopped,
            "timed_out" => Self::TimedOut,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// A query known to the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHandle {
    pub query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_id: Option<i64>,
    pub submitted_at: DateTime<Utc>,
    state: QueryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl QueryHandle {
    /// Handle for a freshly submitted query.
    pub fn new(query_id: impl Into<String>, sql: impl Into<String>, database_id: i64) -> Self {
        Self {
            query_id: query_id.into(),
            sql: Some(sql.into()),
            database_id: Some(database_id),
            submitted_at: Utc::now(),
            state: QueryState::Pending,
            error: None,
        }
    }

    /// Rebuilds a handle from an id alone. The state is unknown until polled.
    pub fn resume(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            sql: None,
            database_id: None,
            submitted_at: Utc::now(),
            state: QueryState::Pending,
            error: None,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Platform-reported failure message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Applies a status report. Backward or post-terminal moves are ignored.
    ///
    /// Returns true if the state changed.
    pub fn advance(&mut self, next: QueryState, error: Option<String>) -> bool {
        if next == self.state || !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next == QueryState::Failed {
            self.error = error.or_else(|| self.error.take());
        }
        true
    }
}

/// Result column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl<'de> Deserialize<'de> for ColumnInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Object {
                #[serde(alias = "column_name")]
                name: String,
                #[serde(default, rename = "type")]
                data_type: Option<Value>,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Name(name) => Ok(Self {
                name,
                data_type: None,
            }),
            Raw::Object { name, data_type } => {
                let data_type = match data_type {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => Some(other.to_string()),
                };
                if name.is_empty() {
                    return Err(de::Error::custom("column without a name"));
                }
                Ok(Self { name, data_type })
            }
        }
    }
}

/// One result row, values in column order.
pub type Row = Vec<Value>;

/// Tabular result of a successful query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
}

impl QueryResult {
    /// Builds a result, keeping `row_count` equal to the number of rows.
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Row>, truncated: bool) -> Self {
        Self {
            row_count: rows.len(),
            columns,
            rows,
            truncated,
        }
    }

    /// Converts a platform row (array or object) into column order.
    pub fn normalize_row(columns: &[ColumnInfo], raw: Value) -> Row {
        match raw {
            Value::Array(values) => values,
            Value::Object(mut map) => columns
                .iter()
                .map(|c| map.remove(&c.name).unwrap_or(Value::Null))
                .collect(),
            other => vec![other],
        }
    }
}

/// Advisory cost estimate, passed through from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    #[serde(alias = "result")]
    pub estimate: Value,
}

/// Optional submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitOptions {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub row_limit: Option<u64>,
}

/// Polling schedule for `await_completion`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub backoff_factor: f64,
    pub max_poll_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_poll_interval: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    /// Pause after `current`, grown by the backoff factor and capped.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let grown =
            Duration::try_from_secs_f64(current.as_secs_f64() * factor).unwrap_or(Duration::MAX);
        grown.min(self.max_poll_interval.max(current))
    }
}
