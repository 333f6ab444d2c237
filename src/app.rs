//! Wiring: builds the session manager, gateway, query engine and tool
//! registry from a [`Config`] and serves them over stdio.

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::HttpGateway;
use crate::mcp::McpServer;
use crate::query::{EngineSettings, QueryEngine};
use crate::session::SessionManager;
use crate::tools::{ToolContext, ToolRegistry};

/// The assembled application.
pub struct App {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
}

impl App {
    /// Builds every component. Makes no network calls.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let credentials = config.credentials()?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            // The CSRF token is bound to the platform's session cookie.
            .cookie_store(true)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        let session = Arc::new(SessionManager::new(
            client.clone(),
            credentials,
            config.expiry_skew(),
        ));
        let gateway = Arc::new(HttpGateway::new(client, Arc::clone(&session)));
        let engine = Arc::new(QueryEngine::new(
            Arc::clone(&gateway),
            EngineSettings {
                policy: config.query.poll_policy(),
                max_rows: config.query.max_rows,
                page_size: config.query.page_size,
                read_only: config.query.read_only,
            },
        ));

        Ok(Self {
            registry: Arc::new(ToolRegistry::with_defaults()),
            context: ToolContext {
                session,
                gateway,
                engine,
                cancel: CancellationToken::new(),
            },
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Logs in once; used by `--check`.
    pub async fn check(&self) -> Result<()> {
        let token = self.context.session.authenticate().await?;
        info!(
            "Authenticated against {}, token valid until {}",
            self.context.session.credentials().base_url(),
            token.expires_at()
        );
        Ok(())
    }

    /// Serves MCP on stdin/stdout until the host disconnects.
    pub async fn serve_stdio(&self) -> Result<()> {
        info!(
            "Serving {} tools for {}",
            self.registry.len(),
            self.context.session.credentials().base_url()
        );
        let server = McpServer::new(Arc::clone(&self.registry), self.context.clone());
        server.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Cancels outstanding work, e.g. on Ctrl-C.
    pub fn shutdown(&self) {
        self.context.cancel.cancel();
    }
}
