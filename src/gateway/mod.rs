//! Authenticated HTTP gateway to the platform API.
//!
//! Every platform call except login/refresh goes through [`HttpGateway`],
//! which attaches the bearer token and recovers from exactly one 401 by
//! re-authenticating and retrying the request once. Writes also carry the
//! platform's CSRF token, fetched lazily and cached.

use std::fmt;
use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{describe_transport_error, ApiError};
use crate::session::{SessionManager, TokenState};

const CSRF_PATH: &str = "/security/csrf_token/";
const CSRF_HEADER: &str = "X-CSRFToken";

/// HTTP methods used against the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }

    /// Anything but a read must present the CSRF token.
    fn needs_csrf(self) -> bool {
        self != Self::Get
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_reqwest(), f)
    }
}

/// A successful (2xx) platform response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// Decodes the body into `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        serde_json::from_value(self.body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// Outcome of a single send.
enum Attempt {
    Done(ApiResponse),
    Unauthorized(String),
}

pub struct HttpGateway {
    client: Client,
    session: Arc<SessionManager>,
    csrf: Mutex<Option<String>>,
}

impl HttpGateway {
    pub fn new(client: Client, session: Arc<SessionManager>) -> Self {
        Self {
            client,
            session,
            csrf: Mutex::new(None),
        }
    }

    /// Sends an authenticated request.
    ///
    /// A 401 on the first attempt invalidates the token that was used,
    /// obtains a new one and retries once. A second 401 is returned as
    /// [`ApiError::Unauthorized`]. A write rejected for its CSRF token is
    /// retried once with a freshly fetched one.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(String, String)]>,
    ) -> Result<ApiResponse, ApiError> {
        if !method.needs_csrf() {
            return self.authorized(method, path, body, query, None).await;
        }

        let csrf = self.csrf_token().await;
        match self
            .authorized(method, path, body, query, csrf.as_deref())
            .await
        {
            Err(e) if is_csrf_rejection(&e) => {
                warn!("{} {} rejected the CSRF token, fetching a new one", method, path);
                self.discard_csrf(csrf.as_deref()).await;
                let csrf = self.csrf_token().await;
                self.authorized(method, path, body, query, csrf.as_deref())
                    .await
            }
            other => other,
        }
    }

    pub async fn get(
        &self,
        path: &str,
        query: Option<&[(String, String)]>,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::Get, path, None, query).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse, ApiError> {
        self.request(Method::Post, path, Some(body), None).await
    }

    async fn authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(String, String)]>,
        csrf: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let token = self.session.get_valid_token().await?;

        match self.send(method, path, body, query, csrf, &token).await? {
            Attempt::Done(response) => Ok(response),
            Attempt::Unauthorized(first_body) => {
                warn!("{} {} returned 401, re-authenticating", method, path);
                debug!("401 body: {}", first_body);
                self.session.invalidate_if_current(&token).await;
                let token = self.session.get_valid_token().await?;

                match self.send(method, path, body, query, csrf, &token).await? {
                    Attempt::Done(response) => Ok(response),
                    Attempt::Unauthorized(body) => Err(ApiError::Unauthorized {
                        status: StatusCode::UNAUTHORIZED.as_u16(),
                        body,
                    }),
                }
            }
        }
    }

    /// Cached CSRF token, fetched on first use.
    ///
    /// A failed fetch is logged and the write goes out without the header;
    /// platforms that exempt the API from CSRF accept it.
    async fn csrf_token(&self) -> Option<String> {
        let mut slot = self.csrf.lock().await;
        if let Some(token) = slot.as_ref() {
            return Some(token.clone());
        }

        match self.authorized(Method::Get, CSRF_PATH, None, None, None).await {
            Ok(response) => {
                let token = response.body.get("result").and_then(Value::as_str);
                match token {
                    Some(token) if !token.is_empty() => {
                        debug!("Fetched CSRF token");
                        *slot = Some(token.to_string());
                        slot.clone()
                    }
                    _ => {
                        warn!("CSRF token response did not include a token");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Failed to fetch CSRF token: {}", e);
                None
            }
        }
    }

    /// Drops the cached CSRF token if it is still `stale`.
    async fn discard_csrf(&self, stale: Option<&str>) {
        let mut slot = self.csrf.lock().await;
        if slot.as_deref() == stale {
            *slot = None;
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(String, String)]>,
        csrf: Option<&str>,
        token: &TokenState,
    ) -> Result<Attempt, ApiError> {
        let url = self.session.credentials().endpoint(path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method.as_reqwest(), &url)
            .bearer_auth(token.access_token());
        if let Some(csrf) = csrf {
            request = request.header(CSRF_HEADER, csrf);
        }
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Unreachable(describe_transport_error(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Unreachable(format!("failed to read response: {e}")))?;

        if status == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized(text));
        }
        if !status.is_success() {
            debug!("{} {} failed with {}", method, path, status);
            return Err(ApiError::from_status(status.as_u16(), text));
        }

        Ok(Attempt::Done(ApiResponse {
            status: status.as_u16(),
            body: parse_body(&text),
        }))
    }
}

/// 400 or 403 whose body blames the CSRF token.
fn is_csrf_rejection(error: &ApiError) -> bool {
    match error {
        ApiError::BadRequest { status: 400, body }
        | ApiError::Unauthorized { status: 403, body } => {
            body.to_ascii_lowercase().contains("csrf")
        }
        _ => false,
    }
}

/// JSON bodies are parsed; empty bodies become null, anything else a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
