//! Tool surface: the named operations offered to the assistant host.
//!
//! Each tool validates its JSON arguments, calls into the session manager,
//! query engine or gateway, and returns a JSON value or a [`ToolError`].

mod passthrough;
mod session;
mod sqllab;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, AuthError, QueryError};
use crate::gateway::HttpGateway;
use crate::query::QueryEngine;
use crate::session::SessionManager;

/// Tool metadata advertised through `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Structured tool failure, rendered to the host as `{kind, message, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("INVALID_ARGUMENTS", message)
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new("UNKNOWN_TOOL", format!("No tool named '{name}'"))
    }

    fn with_details(mut self, details: Value) -> Self {
        if details.as_object().is_some_and(|m| !m.is_empty()) {
            self.details = Some(details);
        }
        self
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<AuthError> for ToolError {
    fn from(e: AuthError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ApiError> for ToolError {
    fn from(e: ApiError) -> Self {
        let mut details = serde_json::Map::new();
        if let Some(status) = e.status() {
            details.insert("status".into(), json!(status));
        }
        if let Some(body) = e.body().filter(|b| !b.is_empty()) {
            let body = serde_json::from_str(body).unwrap_or_else(|_| json!(body));
            details.insert("body".into(), body);
        }
        Self::new(e.kind(), e.to_string()).with_details(Value::Object(details))
    }
}

impl From<QueryError> for ToolError {
    fn from(e: QueryError) -> Self {
        let query_id = e.query_id().map(str::to_string);
        let base = match e {
            QueryError::Api(api) => ToolError::from(api),
            other => Self::new(other.kind(), other.to_string()),
        };
        match query_id {
            Some(id) => {
                let mut details = base
                    .details
                    .clone()
                    .and_then(|d| d.as_object().cloned())
                    .unwrap_or_default();
                details.insert("query_id".into(), json!(id));
                base.with_details(Value::Object(details))
            }
            None => base,
        }
    }
}

/// Shared services handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub session: Arc<SessionManager>,
    pub gateway: Arc<HttpGateway>,
    pub engine: Arc<QueryEngine>,
    /// Fires when the host cancels the call or disconnects.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Copy of this context bound to a different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError>;
}

/// Name-indexed set of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in tool.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        session::register(&mut registry);
        sqllab::register(&mut registry);
        passthrough::register(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub async fn call(&self, ctx: &ToolContext, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::unknown_tool(name))?;
        tool.call(ctx, args).await
    }
}

/// Decodes tool arguments; a missing argument object counts as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::invalid_arguments(e.to_string()))
}

/// Identifier accepted as a JSON string or number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Id(pub String);

impl Id {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) if !s.trim().is_empty() => Ok(Self(s.trim().to_string())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Self(n.to_string())),
            other => Err(de::Error::custom(format!(
                "expected a non-empty string or integer id, got {other}"
            ))),
        }
    }
}

/// Integer identifier accepted as a JSON number or numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericId(pub i64);

impl<'de> Deserialize<'de> for NumericId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Id(raw) = Id::deserialize(deserializer)?;
        raw.parse()
            .map(Self)
            .map_err(|_| de::Error::custom(format!("expected an integer id, got '{raw}'")))
    }
}
