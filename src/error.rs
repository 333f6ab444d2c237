//! Error types for analytics-mcp.
//!
//! Each layer has its own error enum so callers can match on the failure
//! class: [`AuthError`] for the session manager, [`ApiError`] for the HTTP
//! gateway and [`QueryError`] for the query engine. [`Error`] wraps all of
//! them for startup and wiring code.

use thiserror::Error;

use crate::query::QueryState;

/// Authentication failures raised by the session manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The platform rejected the configured username/password.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The authentication endpoint could not be reached or answered garbage.
    #[error("Authentication endpoint unreachable: {0}")]
    Unreachable(String),

    /// Refresh and the fallback re-authentication both failed.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl AuthError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials(_) => "INVALID_CREDENTIALS",
            Self::Unreachable(_) => "UNREACHABLE",
            Self::RefreshFailed(_) => "REFRESH_FAILED",
        }
    }
}

/// Failures of an authenticated platform request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 401 after the single refresh-and-retry, or 403.
    #[error("Unauthorized ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Bad request ({status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("Not found ({status}): {body}")]
    NotFound { status: u16, body: String },

    #[error("Rate limited ({status}): {body}")]
    RateLimited { status: u16, body: String },

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    /// Timeout, connection refused, DNS failure.
    #[error("Platform unreachable: {0}")]
    Unreachable(String),

    /// A 2xx response whose body did not have the expected shape.
    #[error("Invalid response from platform: {0}")]
    InvalidResponse(String),

    /// No usable token could be obtained for the request.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ApiError {
    /// Maps a non-2xx status (other than the retried 401) to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Unauthorized { status, body },
            404 => Self::NotFound { status, body },
            429 => Self::RateLimited { status, body },
            500..=599 => Self::ServerError { status, body },
            _ => Self::BadRequest { status, body },
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ServerError { .. } => "SERVER_ERROR",
            Self::Unreachable(_) => "UNREACHABLE",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
            Self::Auth(e) => e.kind(),
        }
    }

    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { status, .. }
            | Self::BadRequest { status, .. }
            | Self::NotFound { status, .. }
            | Self::RateLimited { status, .. }
            | Self::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw response body of the failed response, if there was one.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Unauthorized { body, .. }
            | Self::BadRequest { body, .. }
            | Self::NotFound { body, .. }
            | Self::RateLimited { body, .. }
            | Self::ServerError { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Failures of the query execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query rejected: {0}")]
    SubmissionRejected(String),

    /// Local await deadline passed; the remote query was asked to stop.
    #[error("Query {query_id} did not finish within {waited_ms} ms")]
    Timeout { query_id: String, waited_ms: u64 },

    #[error("Query {query_id} has no results yet (state {state})")]
    NotReady { query_id: String, state: QueryState },

    #[error("Query {query_id} failed: {message}")]
    Failed { query_id: String, message: String },

    /// The platform no longer retains the query or its result set.
    #[error("Results for query {query_id} have expired")]
    Expired { query_id: String },

    #[error("Cost estimation unsupported: {0}")]
    EstimationUnsupported(String),

    /// The caller stopped waiting; the remote query was asked to stop.
    #[error("Waiting for query {query_id} was cancelled")]
    Cancelled { query_id: String },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl QueryError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubmissionRejected(_) => "SUBMISSION_REJECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::NotReady { .. } => "NOT_READY",
            Self::Failed { .. } => "FAILED",
            Self::Expired { .. } => "EXPIRED",
            Self::EstimationUnsupported(_) => "ESTIMATION_UNSUPPORTED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Api(e) => e.kind(),
        }
    }

    /// The query this error is about, if known.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { query_id, .. }
            | Self::NotReady { query_id, .. }
            | Self::Failed { query_id, .. }
            | Self::Expired { query_id }
            | Self::Cancelled { query_id } => Some(query_id),
            _ => None,
        }
    }
}

/// Human-readable summary of a transport-level reqwest failure.
pub(crate) fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("failed to connect: {e}")
    } else {
        format!("request failed: {e}")
    }
}

/// Main error type for startup, configuration and the protocol loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (invalid config file, missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// Host protocol errors (broken stdio, unserializable frames).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a protocol error with the given message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "Configuration Error",
            Self::Auth(_) => "Authentication Error",
            Self::Api(_) => "Platform API Error",
            Self::Query(_) => "Query Error",
            Self::Protocol(_) => "Protocol Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
