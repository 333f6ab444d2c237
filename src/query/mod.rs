//! SQL Lab query execution.
//!
//! [`QueryEngine`] submits SQL to the platform, polls it to completion with
//! bounded backoff, stops it on timeout or cancellation, and retrieves the
//! result set.

mod engine;
mod types;

pub use engine::{EngineSettings, QueryEngine};
pub use types::{
    ColumnInfo, CostEstimate, PollPolicy, QueryHandle, QueryResult, QueryState, Row,
    SubmitOptions,
};
