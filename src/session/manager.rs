//! Session manager: login, token refresh and the single-writer token slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Credentials, TokenState};
use crate::error::{describe_transport_error, AuthError};

/// Login endpoint, relative to the API base URL.
pub const LOGIN_PATH: &str = "/auth/login";

/// Refresh endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Owns the credentials and the current token.
///
/// The token slot is guarded by an async mutex that is held across network
/// refreshes. Callers that find the token stale while a refresh is running
/// wait for it and then see the new token instead of refreshing again.
pub struct SessionManager {
    client: Client,
    credentials: Credentials,
    skew: chrono::Duration,
    state: Mutex<Option<Arc<TokenState>>>,
}

impl SessionManager {
    /// Creates a session manager. No request is made until a token is needed.
    pub fn new(client: Client, credentials: Credentials, skew: Duration) -> Self {
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            client,
            credentials,
            skew,
            state: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Logs in with the stored credentials and replaces the current token.
    pub async fn authenticate(&self) -> Result<Arc<TokenState>, AuthError> {
        let mut slot = self.state.lock().await;
        let token = Arc::new(self.login().await?);
        info!(
            "Authenticated as '{}', token expires at {}",
            self.credentials.username(),
            token.expires_at()
        );
        *slot = Some(Arc::clone(&token));
        Ok(token)
    }

    /// Returns a token that is valid for at least the configured skew.
    ///
    /// Refreshes (or re-authenticates) when the current token is stale. Never
    /// returns a token whose expiry has already passed.
    pub async fn get_valid_token(&self) -> Result<Arc<TokenState>, AuthError> {
        let mut slot = self.state.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.is_fresh(Utc::now(), self.skew) {
                return Ok(Arc::clone(token));
            }
            debug!("Access token is stale (expires at {})", token.expires_at());
        }

        let previous = slot.take();
        let renewed = Arc::new(self.renew(previous.as_deref()).await?);
        *slot = Some(Arc::clone(&renewed));
        Ok(renewed)
    }

    /// Refreshes now, regardless of the current token's freshness.
    pub async fn force_refresh(&self) -> Result<Arc<TokenState>, AuthError> {
        let mut slot = self.state.lock().await;
        let previous = slot.take();
        let renewed = Arc::new(self.renew(previous.as_deref()).await?);
        *slot = Some(Arc::clone(&renewed));
        Ok(renewed)
    }

    /// Drops the token pair; the next request logs in from credentials.
    pub async fn invalidate(&self) {
        if self.state.lock().await.take().is_some() {
            debug!("Session invalidated");
        }
    }

    /// Drops the token only if it is still `stale`.
    ///
    /// Returns false when another caller already replaced it, in which case
    /// the replacement is kept.
    pub async fn invalidate_if_current(&self, stale: &TokenState) -> bool {
        let mut slot = self.state.lock().await;
        match slot.as_ref() {
            Some(current) if current.same_token(stale) => {
                *slot = None;
                debug!("Session invalidated after rejected token");
                true
            }
            _ => false,
        }
    }

    /// Current token, without any network traffic.
    pub async fn current(&self) -> Option<Arc<TokenState>> {
        self.state.lock().await.clone()
    }

    /// Produces a replacement for `previous` (or a first token).
    async fn renew(&self, previous: Option<&TokenState>) -> Result<TokenState, AuthError> {
        let Some(previous) = previous else {
            let token = self.login().await?;
            return ensure_usable(token);
        };

        let refresh_error = match previous.refresh_token() {
            Some(refresh_token) => match self.refresh(refresh_token).await {
                Ok(token) if !token.is_expired(Utc::now()) => {
                    info!("Refreshed access token, expires at {}", token.expires_at());
                    return Ok(token);
                }
                Ok(_) => "refresh issued an already expired token".to_string(),
                Err(e) => {
                    warn!("Token refresh failed, re-authenticating: {}", e);
                    e.to_string()
                }
            },
            None => "no refresh token available".to_string(),
        };

        match self.login().await {
            Ok(token) => {
                info!("Re-authenticated, token expires at {}", token.expires_at());
                ensure_usable(token)
            }
            Err(e) => Err(AuthError::RefreshFailed(format!(
                "{refresh_error}; re-authentication failed: {e}"
            ))),
        }
    }

    async fn login(&self) -> Result<TokenState, AuthError> {
        let url = self.credentials.endpoint(LOGIN_PATH);
        let body = serde_json::json!({
            "username": self.credentials.username(),
            "password": self.credentials.password().expose_secret(),
            "provider": "db",
            "refresh": true,
        });

        debug!("POST {}", url);
        let issued_at = Utc::now();
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(describe_transport_error(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Unreachable(format!("failed to read login response: {e}")))?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                400 | 401 | 403 => {
                    AuthError::InvalidCredentials(format!("login rejected ({status}): {text}"))
                }
                _ => AuthError::Unreachable(format!("login returned {status}: {text}")),
            });
        }

        let parsed = TokenResponse::parse(&text).map_err(AuthError::Unreachable)?;
        let expires_in = parsed.expires_in();
        Ok(TokenState::new(
            parsed.access_token,
            parsed.refresh_token,
            issued_at,
            expires_in,
        ))
    }

    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenState, AuthError> {
        let url = self.credentials.endpoint(REFRESH_PATH);
        let body = serde_json::json!({ "refresh_token": refresh_token.expose_secret() });

        debug!("POST {}", url);
        let issued_at = Utc::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(refresh_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(describe_transport_error(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("failed to read refresh response: {e}")))?;

        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "refresh returned {status}: {text}"
            )));
        }

        let parsed = TokenResponse::parse(&text).map_err(AuthError::RefreshFailed)?;
        let expires_in = parsed.expires_in();
        // Platforms that do not rotate refresh tokens omit it here.
        let refresh_token = parsed
            .refresh_token
            .or_else(|| Some(refresh_token.expose_secret().clone()));

        Ok(TokenState::new(
            parsed.access_token,
            refresh_token,
            issued_at,
            expires_in,
        ))
    }
}

fn ensure_usable(token: TokenState) -> Result<TokenState, AuthError> {
    if token.is_expired(Utc::now()) {
        return Err(AuthError::RefreshFailed(
            "platform issued a token without a usable lifetime".to_string(),
        ));
    }
    Ok(token)
}

/// Body of a successful login or refresh.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<f64>,
}

impl TokenResponse {
    fn parse(text: &str) -> Result<Self, String> {
        let parsed: TokenResponse = serde_json::from_str(text)
            .map_err(|e| format!("unexpected token response: {e}"))?;
        if parsed.access_token.is_empty() {
            return Err("token response did not include an access token".to_string());
        }
        Ok(parsed)
    }

    fn expires_in(&self) -> Option<chrono::Duration> {
        self.expires_in
            .filter(|secs| secs.is_finite())
            .and_then(|secs| chrono::Duration::try_milliseconds((secs * 1000.0) as i64))
    }
}
