//! SQL Lab query execution: submit, poll, stop, fetch and estimate.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    ColumnInfo, CostEstimate, PollPolicy, QueryHandle, QueryResult, QueryState, SubmitOptions,
};
use crate::error::{ApiError, QueryError};
use crate::gateway::HttpGateway;
use crate::safety::{classify_sql, SafetyLevel};

const EXECUTE_PATH: &str = "/sqllab/execute";
const ESTIMATE_PATH: &str = "/sqllab/estimate";

/// Deadline used when `started + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn status_path(query_id: &str) -> String {
    format!("/sqllab/query/{query_id}")
}

fn results_path(query_id: &str) -> String {
    format!("/sqllab/results/{query_id}")
}

fn stop_path(query_id: &str) -> String {
    format!("/sqllab/stop/{query_id}")
}

/// Engine-wide settings, taken from the `[query]` config section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: PollPolicy,
    pub max_rows: usize,
    pub page_size: Option<usize>,
    pub read_only: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: PollPolicy::default(),
            max_rows: 10_000,
            page_size: None,
            read_only: false,
        }
    }
}

/// Drives queries through the platform's SQL Lab API.
///
/// Holds no per-query state; callers keep the [`QueryHandle`].
pub struct QueryEngine {
    gateway: Arc<HttpGateway>,
    settings: EngineSettings,
}

impl QueryEngine {
    pub fn new(gateway: Arc<HttpGateway>, settings: EngineSettings) -> Self {
        Self { gateway, settings }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.settings.policy
    }

    /// Submits `sql` for asynchronous execution.
    pub async fn submit(
        &self,
        sql: &str,
        database_id: i64,
        options: &SubmitOptions,
    ) -> Result<QueryHandle, QueryError> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(QueryError::SubmissionRejected("SQL text is empty".to_string()));
        }
        if self.settings.read_only {
            let classification = classify_sql(sql);
            if classification.level != SafetyLevel::ReadOnly {
                return Err(QueryError::SubmissionRejected(format!(
                    "read-only mode: {} statement not allowed ({})",
                    classification.statement_type, classification.level
                )));
            }
        }

        let mut body = json!({
            "sql": sql,
            "database_id": database_id,
            "runAsync": true,
            "tab": "analytics-mcp",
        });
        if let Some(schema) = &options.schema {
            body["schema"] = json!(schema);
        }
        if let Some(limit) = options.row_limit {
            body["queryLimit"] = json!(limit);
        }

        let response = self
            .gateway
            .post(EXECUTE_PATH, &body)
            .await
            .map_err(|e| match e {
                ApiError::BadRequest { body, .. } | ApiError::NotFound { body, .. } => {
                    QueryError::SubmissionRejected(platform_message(&body))
                }
                other => QueryError::Api(other),
            })?;

        let submitted: SubmitResponse = response.json()?;
        let query_id = submitted.query_id().ok_or_else(|| {
            QueryError::Api(ApiError::InvalidResponse(
                "submission response did not include a query id".to_string(),
            ))
        })?;

        let mut handle = QueryHandle::new(query_id, sql, database_id);
        if let Some(status) = submitted.status() {
            handle.advance(QueryState::parse_platform(status), submitted.error_message());
        }
        info!("Submitted query {} on database {}", handle.query_id, database_id);
        Ok(handle)
    }

    /// Fetches the current status once and advances the handle.
    pub async fn poll(&self, handle: &mut QueryHandle) -> Result<QueryState, QueryError> {
        let response = self
            .gateway
            .get(&status_path(&handle.query_id), None)
            .await
            .map_err(|e| match e {
                ApiError::NotFound { .. } => QueryError::Expired {
                    query_id: handle.query_id.clone(),
                },
                other => QueryError::Api(other),
            })?;

        let report: StatusResponse = response.json()?;
        let reported = report.status().map(QueryState::parse_platform);
        if let Some(next) = reported {
            if handle.advance(next, report.error_message()) {
                debug!("Query {} is now {}", handle.query_id, handle.state());
            }
        }
        Ok(handle.state())
    }

    /// Polls until the query reaches a terminal state.
    ///
    /// On deadline the remote query is stopped once, the handle is marked
    /// TIMED_OUT and [`QueryError::Timeout`] is returned. If `cancel` fires,
    /// the query is stopped and [`QueryError::Cancelled`] is returned.
    pub async fn await_completion(
        &self,
        handle: &mut QueryHandle,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueryError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut interval = poll_interval;
        let mut guard = StopGuard::new(Arc::clone(&self.gateway), handle.query_id.clone());

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                state = self.poll(handle) => Some(state),
            };
            let state = match polled {
                Some(Ok(state)) => state,
                Some(Err(e)) => {
                    guard.disarm();
                    if !matches!(e, QueryError::Expired { .. }) {
                        warn!("Polling query {} failed, stopping it: {}", handle.query_id, e);
                        self.stop_quietly(&handle.query_id).await;
                    }
                    return Err(e);
                }
                None => {
                    guard.disarm();
                    return Err(self.cancelled(handle).await);
                }
            };

            if state.is_terminal() {
                guard.disarm();
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                guard.disarm();
                let waited_ms = now.duration_since(started).as_millis() as u64;
                warn!("Query {} timed out after {} ms", handle.query_id, waited_ms);
                self.stop_quietly(&handle.query_id).await;
                handle.advance(QueryState::TimedOut, None);
                return Err(QueryError::Timeout {
                    query_id: handle.query_id.clone(),
                    waited_ms,
                });
            }

            let pause = interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    guard.disarm();
                    return Err(self.cancelled(handle).await);
                }
                _ = tokio::time::sleep(pause) => {}
            }
            interval = self.settings.policy.next_interval(interval);
        }
    }

    /// Asks the platform to stop the query.
    pub async fn stop(&self, handle: &mut QueryHandle) -> Result<QueryState, QueryError> {
        let response = self
            .gateway
            .post(&stop_path(&handle.query_id), &json!({}))
            .await
            .map_err(|e| match e {
                ApiError::NotFound { .. } => QueryError::Expired {
                    query_id: handle.query_id.clone(),
                },
                other => QueryError::Api(other),
            })?;

        let reported = serde_json::from_value::<StatusResponse>(response.body)
            .ok()
            .and_then(|r| r.status().map(QueryState::parse_platform))
            .filter(|s| s.is_terminal())
            .unwrap_or(QueryState::Stopped);
        handle.advance(reported, None);
        info!("Stopped query {}", handle.query_id);
        Ok(handle.state())
    }

    /// Retrieves the result set of a successful query.
    ///
    /// Pages are requested until a short page arrives or `max_rows` is
    /// reached; rows past `max_rows` are dropped and `truncated` is set.
    pub async fn fetch_results(
        &self,
        handle: &QueryHandle,
        page_size: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        match handle.state() {
            QueryState::Success => {}
            QueryState::Failed => {
                return Err(QueryError::Failed {
                    query_id: handle.query_id.clone(),
                    message: handle
                        .error_message()
                        .unwrap_or("query failed without a message")
                        .to_string(),
                })
            }
            state => {
                return Err(QueryError::NotReady {
                    query_id: handle.query_id.clone(),
                    state,
                })
            }
        }

        let max_rows = self.settings.max_rows;
        let page_size = page_size.or(self.settings.page_size);
        let mut columns: Vec<ColumnInfo> = Vec::new();
        let mut rows = Vec::new();
        let mut truncated = false;
        let mut page = 0usize;

        loop {
            let query = page_size.map(|size| {
                vec![
                    ("page".to_string(), page.to_string()),
                    ("page_size".to_string(), size.to_string()),
                ]
            });
            let response = self
                .gateway
                .get(&results_path(&handle.query_id), query.as_deref())
                .await
                .map_err(|e| match e {
                    ApiError::NotFound { .. } => QueryError::Expired {
                        query_id: handle.query_id.clone(),
                    },
                    ApiError::BadRequest { status: 410, .. } => QueryError::Expired {
                        query_id: handle.query_id.clone(),
                    },
                    other => QueryError::Api(other),
                })?;

            let body: ResultsResponse = response.json()?;
            let ResultsPayload {
                columns: page_columns,
                data,
                truncated: platform_truncated,
            } = body.into_payload();

            if columns.is_empty() {
                columns = page_columns;
            }
            truncated |= platform_truncated;

            let received = data.len();
            for raw in data {
                if rows.len() >= max_rows {
                    truncated = true;
                    break;
                }
                rows.push(QueryResult::normalize_row(&columns, raw));
            }

            match page_size {
                Some(size) if received >= size && !truncated => {
                    if rows.len() >= max_rows {
                        // More pages may exist beyond the cap.
                        truncated = true;
                        break;
                    }
                    page += 1;
                }
                _ => break,
            }
        }

        let result = QueryResult::new(columns, rows, truncated);
        debug!(
            "Fetched {} rows for query {} (truncated: {})",
            result.row_count, handle.query_id, result.truncated
        );
        Ok(result)
    }

    /// Asks the platform for an advisory cost estimate.
    pub async fn estimate_cost(
        &self,
        sql: &str,
        database_id: i64,
    ) -> Result<CostEstimate, QueryError> {
        let query = vec![
            ("sql".to_string(), sql.to_string()),
            ("database_id".to_string(), database_id.to_string()),
        ];
        let response = self
            .gateway
            .get(ESTIMATE_PATH, Some(&query))
            .await
            .map_err(|e| match e {
                ApiError::BadRequest { body, .. }
                | ApiError::NotFound { body, .. }
                | ApiError::ServerError { status: 501, body } => {
                    QueryError::EstimationUnsupported(platform_message(&body))
                }
                other => QueryError::Api(other),
            })?;

        match response.body {
            Value::Object(map) if map.contains_key("estimate") || map.contains_key("result") => {
                let estimate: CostEstimate = serde_json::from_value(Value::Object(map))
                    .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
                Ok(estimate)
            }
            other => Ok(CostEstimate { estimate: other }),
        }
    }

    /// Rebuilds a handle from `query_id` and polls it once.
    pub async fn status(&self, query_id: &str) -> Result<QueryHandle, QueryError> {
        let mut handle = QueryHandle::resume(query_id);
        self.poll(&mut handle).await?;
        Ok(handle)
    }

    /// Submits, waits with the configured policy, then fetches results.
    pub async fn execute(
        &self,
        sql: &str,
        database_id: i64,
        options: &SubmitOptions,
        cancel: &CancellationToken,
    ) -> Result<(QueryHandle, QueryResult), QueryError> {
        let mut handle = self.submit(sql, database_id, options).await?;
        let policy = self.settings.policy;
        self.await_completion(&mut handle, policy.timeout, policy.poll_interval, cancel)
            .await?;
        let result = self.fetch_results(&handle, None).await?;
        Ok((handle, result))
    }

    async fn cancelled(&self, handle: &mut QueryHandle) -> QueryError {
        info!("Stopped waiting for query {}", handle.query_id);
        if self.stop_quietly(&handle.query_id).await {
            handle.advance(QueryState::Stopped, None);
        }
        QueryError::Cancelled {
            query_id: handle.query_id.clone(),
        }
    }

    /// Best-effort stop; failures are logged only.
    async fn stop_quietly(&self, query_id: &str) -> bool {
        match self.gateway.post(&stop_path(query_id), &json!({})).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to stop query {}: {}", query_id, e);
                false
            }
        }
    }
}

/// Stops the remote query if an await is dropped mid-poll.
struct StopGuard {
    gateway: Arc<HttpGateway>,
    query_id: String,
    armed: bool,
}

impl StopGuard {
    fn new(gateway: Arc<HttpGateway>, query_id: String) -> Self {
        Self {
            gateway,
            query_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let query_id = std::mem::take(&mut self.query_id);
        runtime.spawn(async move {
            if let Err(e) = gateway.post(&stop_path(&query_id), &json!({})).await {
                warn!("Failed to stop abandoned query {}: {}", query_id, e);
            }
        });
    }
}

/// Extracts `message`/`error` from an error body, else returns it as-is.
fn platform_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "error", "msg"]
                .iter()
                .find_map(|key| v.get(*key).map(value_text))
        })
        .unwrap_or_else(|| body.to_string())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Query ids arrive as strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryFields {
    #[serde(default, alias = "queryId", alias = "id")]
    query_id: Option<RawId>,
    #[serde(default, alias = "state")]
    status: Option<String>,
    #[serde(default, alias = "errorMessage", alias = "error_message")]
    error: Option<Value>,
}

/// Submit answers either flat or nested under `query`.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(flatten)]
    top: QueryFields,
    #[serde(default)]
    query: Option<QueryFields>,
}

impl SubmitResponse {
    fn query_id(&self) -> Option<String> {
        let raw = self
            .top
            .query_id
            .as_ref()
            .or_else(|| self.query.as_ref().and_then(|q| q.query_id.as_ref()))?;
        let id = raw.clone().into_string();
        (!id.is_empty()).then_some(id)
    }

    fn status(&self) -> Option<&str> {
        self.top
            .status
            .as_deref()
            .or_else(|| self.query.as_ref().and_then(|q| q.status.as_deref()))
    }

    fn error_message(&self) -> Option<String> {
        self.top
            .error
            .as_ref()
            .or_else(|| self.query.as_ref().and_then(|q| q.error.as_ref()))
            .filter(|v| !v.is_null())
            .map(value_text)
    }
}

/// Status answers are `{status, error?}`, possibly wrapped in `result`/`query`.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(flatten)]
    top: QueryFields,
    #[serde(default, alias = "query")]
    result: Option<QueryFields>,
}

impl StatusResponse {
    fn status(&self) -> Option<&str> {
        self.top
            .status
            .as_deref()
            .or_else(|| self.result.as_ref().and_then(|q| q.status.as_deref()))
    }

    fn error_message(&self) -> Option<String> {
        self.top
            .error
            .as_ref()
            .or_else(|| self.result.as_ref().and_then(|q| q.error.as_ref()))
            .filter(|v| !v.is_null())
            .map(value_text)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResultsPayload {
    #[serde(default)]
    columns: Vec<ColumnInfo>,
    #[serde(default, alias = "rows")]
    data: Vec<Value>,
    #[serde(default, alias = "displayLimitReached")]
    truncated: bool,
}

/// Results arrive flat or wrapped in `result`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResultsResponse {
    Wrapped { result: ResultsPayload },
    Flat(ResultsPayload),
}

impl ResultsResponse {
    fn into_payload(self) -> ResultsPayload {
        match self {
            Self::Wrapped { result } => result,
            Self::Flat(payload) => payload,
        }
    }
}
