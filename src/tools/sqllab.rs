//! SQL Lab tools built on the query engine.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Id, NumericId, Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry};
use crate::query::{QueryHandle, QueryState, SubmitOptions};

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(Box::new(ExecuteQuery));
    registry.register(Box::new(SubmitQuery));
    registry.register(Box::new(GetQueryStatus));
    registry.register(Box::new(AwaitQuery));
    registry.register(Box::new(GetResults));
    registry.register(Box::new(StopQuery));
    registry.register(Box::new(EstimateQueryCost));
    registry.register(Box::new(FormatSql));
}

#[derive(Debug, Deserialize)]
struct SqlArgs {
    sql: String,
    database_id: NumericId,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    row_limit: Option<u64>,
}

impl SqlArgs {
    fn options(&self) -> SubmitOptions {
        SubmitOptions {
            schema: self.schema.clone(),
            row_limit: self.row_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryIdArgs {
    query_id: Id,
}

#[derive(Debug, Deserialize)]
struct AwaitArgs {
    query_id: Id,
    #[serde(default)]
    timeout_secs: Option<f64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FormatArgs {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct ResultsArgs {
    query_id: Id,
    #[serde(default)]
    page_size: Option<usize>,
}

fn sql_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "sql": { "type": "string", "description": "SQL text to run" },
            "database_id": {
                "type": ["integer", "string"],
                "description": "Platform database id"
            },
            "schema": { "type": "string", "description": "Default schema (optional)" },
            "row_limit": {
                "type": "integer",
                "description": "Row limit applied by the platform (optional)"
            }
        },
        "required": ["sql", "database_id"]
    })
}

fn query_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query_id": {
                "type": ["string", "integer"],
                "description": "Id returned by analytics_sqllab_submit_query"
            }
        },
        "required": ["query_id"]
    })
}

fn handle_json(handle: &QueryHandle) -> Value {
    let mut value = json!({
        "query_id": handle.query_id,
        "state": handle.state(),
    });
    if let Some(error) = handle.error_message() {
        value["error"] = json!(error);
    }
    value
}

/// Longest wait a host may ask for; larger values are clamped.
const MAX_AWAIT: Duration = Duration::from_secs(24 * 60 * 60);

fn duration_from_secs(secs: f64) -> Result<Duration, ToolError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(ToolError::invalid_arguments(
            "timeout_secs must be a positive number",
        ));
    }
    Ok(Duration::try_from_secs_f64(secs).map_or(MAX_AWAIT, |d| d.min(MAX_AWAIT)))
}

struct ExecuteQuery;

#[async_trait]
impl Tool for ExecuteQuery {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_execute_query".to_string(),
            description: "Run SQL against a platform database and wait for the result rows. \
                          Long queries are stopped when the configured timeout passes."
                .to_string(),
            input_schema: sql_schema(),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SqlArgs = parse_args(args)?;
        let (handle, result) = ctx
            .engine
            .execute(&args.sql, args.database_id.0, &args.options(), &ctx.cancel)
            .await?;
        Ok(json!({
            "query_id": handle.query_id,
            "state": handle.state(),
            "columns": result.columns,
            "rows": result.rows,
            "row_count": result.row_count,
            "truncated": result.truncated,
        }))
    }
}

struct SubmitQuery;

#[async_trait]
impl Tool for SubmitQuery {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_submit_query".to_string(),
            description: "Submit SQL for asynchronous execution and return its query id \
                          without waiting."
                .to_string(),
            input_schema: sql_schema(),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SqlArgs = parse_args(args)?;
        let handle = ctx
            .engine
            .submit(&args.sql, args.database_id.0, &args.options())
            .await?;
        Ok(handle_json(&handle))
    }
}

struct GetQueryStatus;

#[async_trait]
impl Tool for GetQueryStatus {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_get_query_status".to_string(),
            description: "Fetch the current state of a submitted query.".to_string(),
            input_schema: query_id_schema(),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: QueryIdArgs = parse_args(args)?;
        let handle = ctx.engine.status(args.query_id.as_str()).await?;
        Ok(handle_json(&handle))
    }
}

struct AwaitQuery;

#[async_trait]
impl Tool for AwaitQuery {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_await_query".to_string(),
            description: "Wait until a submitted query finishes. The query is stopped if it \
                          is still running when the timeout passes."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query_id": { "type": ["string", "integer"] },
                    "timeout_secs": {
                        "type": "number",
                        "description": "How long to wait (defaults to the server setting)"
                    },
                    "poll_interval_ms": {
                        "type": "integer",
                        "description": "First pause between status checks"
                    }
                },
                "required": ["query_id"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: AwaitArgs = parse_args(args)?;
        let policy = ctx.engine.policy();
        let timeout = match args.timeout_secs {
            Some(secs) => duration_from_secs(secs)?,
            None => policy.timeout,
        };
        let poll_interval = match args.poll_interval_ms {
            Some(0) => {
                return Err(ToolError::invalid_arguments(
                    "poll_interval_ms must be positive",
                ))
            }
            Some(ms) => Duration::from_millis(ms),
            None => policy.poll_interval,
        };

        let mut handle = QueryHandle::resume(args.query_id.as_str());
        ctx.engine
            .await_completion(&mut handle, timeout, poll_interval, &ctx.cancel)
            .await?;
        Ok(handle_json(&handle))
    }
}

struct GetResults;

#[async_trait]
impl Tool for GetResults {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_get_results".to_string(),
            description: "Fetch the result rows of a finished query. Fails with NOT_READY \
                          while the query is still running."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query_id": { "type": ["string", "integer"] },
                    "page_size": {
                        "type": "integer",
                        "description": "Fetch results in pages of this size (optional)"
                    }
                },
                "required": ["query_id"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: ResultsArgs = parse_args(args)?;
        if args.page_size == Some(0) {
            return Err(ToolError::invalid_arguments("page_size must be positive"));
        }
        let handle = ctx.engine.status(args.query_id.as_str()).await?;
        let result = ctx.engine.fetch_results(&handle, args.page_size).await?;
        serde_json::to_value(result).map_err(|e| ToolError::new("INTERNAL", e.to_string()))
    }
}

struct StopQuery;

#[async_trait]
impl Tool for StopQuery {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_stop_query".to_string(),
            description: "Ask the platform to stop a running query.".to_string(),
            input_schema: query_id_schema(),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: QueryIdArgs = parse_args(args)?;
        let mut handle = QueryHandle::resume(args.query_id.as_str());
        let state = ctx.engine.stop(&mut handle).await?;
        Ok(json!({
            "query_id": handle.query_id,
            "state": state,
            "stopped": state == QueryState::Stopped,
        }))
    }
}

struct EstimateQueryCost;

#[async_trait]
impl Tool for EstimateQueryCost {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_estimate_query_cost".to_string(),
            description: "Ask the platform for an advisory cost estimate of SQL without \
                          running it. Not every database engine supports this."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string" },
                    "database_id": { "type": ["integer", "string"] }
                },
                "required": ["sql", "database_id"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: SqlArgs = parse_args(args)?;
        let estimate = ctx
            .engine
            .estimate_cost(&args.sql, args.database_id.0)
            .await?;
        Ok(json!({ "estimate": estimate.estimate }))
    }
}

struct FormatSql;

#[async_trait]
impl Tool for FormatSql {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_sqllab_format_sql".to_string(),
            description: "Pretty-print SQL using the platform's formatter. Nothing is executed."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "SQL text to format" }
                },
                "required": ["sql"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: FormatArgs = parse_args(args)?;
        let response = ctx
            .gateway
            .post("/sqllab/format_sql", &json!({ "sql": args.sql }))
            .await?;
        Ok(response.body)
    }
}
