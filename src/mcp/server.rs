//! Line-delimited JSON-RPC server loop.
//!
//! Requests are read one per line. `tools/call` requests run in their own
//! task with their own cancellation token so a slow query never blocks the
//! loop, and `notifications/cancelled` can stop them. All responses go
//! through a single writer task.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    CancelledParams, InitializeResult, JsonRpcMessage, JsonRpcResponse, ToolsCallParams,
    ToolsCallResult, ToolsListResult, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::error::{Error, Result};
use crate::tools::{ToolContext, ToolRegistry};

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct McpServer {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext) -> Self {
        Self { registry, context }
    }

    /// Serves until `reader` reaches EOF, then cancels outstanding calls
    /// and waits for them to wind down.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let shutdown = self.context.cancel.clone();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let mut calls = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Host closed stdin, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from host: {}", e);
                    break;
                }
            };

            // Reap finished calls so the set does not grow without bound.
            while calls.try_join_next().is_some() {}

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!("host -> server: {}", line);

            let message = match parse_message(line) {
                Ok(message) => message,
                Err(response) => {
                    let _ = tx.send(response);
                    continue;
                }
            };

            if message.method == "tools/call" {
                if let Some(id) = message.id.clone() {
                    self.spawn_call(id, message.params, &tx, &in_flight, &mut calls)
                        .await;
                    continue;
                }
            }

            if let Some(response) = self.handle(message, &in_flight).await {
                let _ = tx.send(response);
            }
        }

        shutdown.cancel();
        while calls.join_next().await.is_some() {}
        drop(tx);

        writer_task
            .await
            .map_err(|e| Error::internal(format!("writer task failed: {e}")))?
    }

    /// Handles everything except `tools/call`. Returns `None` for
    /// notifications.
    async fn handle(&self, message: JsonRpcMessage, in_flight: &InFlight) -> Option<JsonRpcResponse> {
        let JsonRpcMessage {
            id, method, params, ..
        } = message;

        let result = match method.as_str() {
            "initialize" => serde_json::to_value(InitializeResult::for_this_server())
                .map_err(|e| (INTERNAL_ERROR, e.to_string())),
            "ping" => Ok(json!({})),
            "tools/list" => serde_json::to_value(ToolsListResult {
                tools: self.registry.definitions(),
            })
            .map_err(|e| (INTERNAL_ERROR, e.to_string())),
            "tools/call" => Err((INVALID_REQUEST, "tools/call requires an id".to_string())),
            "notifications/initialized" => return None,
            "notifications/cancelled" => {
                cancel_request(params, in_flight).await;
                return None;
            }
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        };

        let Some(id) = id else {
            debug!("Ignoring notification {}", method);
            return None;
        };
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err((code, message)) => JsonRpcResponse::failure(id, code, message),
        })
    }

    async fn spawn_call(
        &self,
        id: Value,
        params: Option<Value>,
        tx: &mpsc::UnboundedSender<JsonRpcResponse>,
        in_flight: &InFlight,
        calls: &mut JoinSet<()>,
    ) {
        let params: ToolsCallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                let _ = tx.send(JsonRpcResponse::failure(id, INVALID_PARAMS, "missing params"));
                return;
            }
            Err(e) => {
                let _ = tx.send(JsonRpcResponse::failure(id, INVALID_PARAMS, e.to_string()));
                return;
            }
        };

        let key = id.to_string();
        let cancel = self.context.cancel.child_token();
        in_flight.lock().await.insert(key.clone(), cancel.clone());

        let ctx = self.context.with_cancel(cancel.clone());
        let registry = Arc::clone(&self.registry);
        let tx = tx.clone();
        let in_flight = Arc::clone(in_flight);

        calls.spawn(async move {
            info!("Calling tool {}", params.name);
            let outcome = AssertUnwindSafe(registry.call(&ctx, &params.name, params.arguments))
                .catch_unwind()
                .await;
            in_flight.lock().await.remove(&key);

            let result = match outcome {
                Ok(Ok(value)) => ToolsCallResult::json(&value, false),
                Ok(Err(e)) => {
                    warn!("Tool {} failed: {}", params.name, e);
                    let value = serde_json::to_value(&e).unwrap_or_else(|_| json!(e.to_string()));
                    ToolsCallResult::json(&value, true)
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Tool {} panicked: {}", params.name, reason);
                    let _ = tx.send(JsonRpcResponse::failure(
                        id,
                        INTERNAL_ERROR,
                        format!("tool {} panicked: {reason}", params.name),
                    ));
                    return;
                }
            };

            if cancel.is_cancelled() {
                debug!("Dropping response for cancelled request {}", key);
                return;
            }
            let response = match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
            };
            let _ = tx.send(response);
        });
    }
}

fn parse_message(line: &str) -> std::result::Result<JsonRpcMessage, JsonRpcResponse> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| JsonRpcResponse::failure(id, INVALID_REQUEST, format!("Invalid request: {e}")))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn cancel_request(params: Option<Value>, in_flight: &InFlight) {
    let Some(params) = params.and_then(|p| serde_json::from_value::<CancelledParams>(p).ok()) else {
        warn!("Ignoring malformed cancellation");
        return;
    };
    let key = params.request_id.to_string();
    match in_flight.lock().await.get(&key) {
        Some(token) => {
            info!(
                "Host cancelled request {} ({})",
                key,
                params.reason.as_deref().unwrap_or("no reason given")
            );
            token.cancel();
        }
        None => debug!("Cancellation for unknown or finished request {}", key),
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)
            .map_err(|e| Error::protocol(format!("failed to encode response: {e}")))?;
        debug!("server -> host: {}", line);
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::protocol(format!("failed to write to host: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::protocol(format!("failed to flush to host: {e}")))?;
    }
    Ok(())
}
