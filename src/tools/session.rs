//! Authentication tools.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry};

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(Box::new(Authenticate));
    registry.register(Box::new(Status));
    registry.register(Box::new(RefreshToken));
    registry.register(Box::new(Logout));
}

fn no_arguments() -> Value {
    json!({ "type": "object", "properties": {} })
}

struct Authenticate;

#[async_trait]
impl Tool for Authenticate {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_auth_authenticate".to_string(),
            description: "Log in to the analytics platform with the configured credentials and \
                          report the new token's lifetime."
                .to_string(),
            input_schema: no_arguments(),
        }
    }

    async fn call(&self, ctx: &ToolContext, _args: Value) -> Result<Value, ToolError> {
        let token = ctx.session.authenticate().await?;
        Ok(json!({
            "authenticated": true,
            "username": ctx.session.credentials().username(),
            "token": token.summary(Utc::now()),
        }))
    }
}

struct Status;

#[async_trait]
impl Tool for Status {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_auth_status".to_string(),
            description: "Report whether a session token is held and when it expires. \
                          Makes no network calls."
                .to_string(),
            input_schema: no_arguments(),
        }
    }

    async fn call(&self, ctx: &ToolContext, _args: Value) -> Result<Value, ToolError> {
        let now = Utc::now();
        let status = match ctx.session.current().await {
            Some(token) => json!({
                "authenticated": !token.is_expired(now),
                "base_url": ctx.session.credentials().base_url(),
                "username": ctx.session.credentials().username(),
                "token": token.summary(now),
            }),
            None => json!({
                "authenticated": false,
                "base_url": ctx.session.credentials().base_url(),
                "username": ctx.session.credentials().username(),
            }),
        };
        Ok(status)
    }
}

struct RefreshToken;

#[async_trait]
impl Tool for RefreshToken {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_auth_refresh_token".to_string(),
            description: "Refresh the session token now, re-authenticating if the refresh \
                          token is missing or rejected."
                .to_string(),
            input_schema: no_arguments(),
        }
    }

    async fn call(&self, ctx: &ToolContext, _args: Value) -> Result<Value, ToolError> {
        let token = ctx.session.force_refresh().await?;
        Ok(json!({
            "refreshed": true,
            "token": token.summary(Utc::now()),
        }))
    }
}

struct Logout;

#[async_trait]
impl Tool for Logout {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analytics_auth_logout".to_string(),
            description: "Discard the session token. The next call logs in again.".to_string(),
            input_schema: no_arguments(),
        }
    }

    async fn call(&self, ctx: &ToolContext, _args: Value) -> Result<Value, ToolError> {
        ctx.session.invalidate().await;
        Ok(json!({ "logged_out": true }))
    }
}
