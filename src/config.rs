//! Configuration management for analytics-mcp.
//!
//! Handles loading configuration from TOML files and environment variables,
//! with the platform connection, session and query polling settings.

use crate::error::{Error, Result};
use crate::query::PollPolicy;
use crate::session::Credentials;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable holding the platform API base URL.
pub const ENV_API_URL: &str = "ANALYTICS_API_URL";
/// Environment variable holding the platform username.
pub const ENV_USER: &str = "ANALYTICS_USER";
/// Environment variable holding the platform password.
pub const ENV_PASS: &str = "ANALYTICS_PASS";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Platform connection settings.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Token lifecycle settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// SQL Lab polling and result settings.
    #[serde(default)]
    pub query: QueryConfig,
}

/// Platform connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// API base URL, including any `/api/v1` prefix.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Login username.
    pub username: Option<String>,

    /// Login password (prefer the ANALYTICS_PASS environment variable).
    pub password: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8088/api/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: None,
            password: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Token lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Safety margin subtracted from a token's expiry.
    #[serde(default = "default_expiry_skew_secs")]
    pub expiry_skew_secs: u64,
}

fn default_expiry_skew_secs() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_skew_secs: default_expiry_skew_secs(),
        }
    }
}

/// SQL Lab polling and result settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// How long `await` waits for a query before stopping it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// First pause between status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Growth factor applied to the pause after each poll.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for the pause between polls.
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Rows kept from a result set before it is marked truncated.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Page size for result retrieval; `None` fetches results in one call.
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Reject SQL that is not a read-only query before submitting it.
    #[serde(default)]
    pub read_only: bool,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_rows() -> usize {
    10_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_factor: default_backoff_factor(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            max_rows: default_max_rows(),
            page_size: None,
            read_only: false,
        }
    }
}

impl QueryConfig {
    /// Polling policy described by this section.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff_factor: self.backoff_factor,
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
        }
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("analytics-mcp")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            Error::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies ANALYTICS_* environment variables over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.platform.base_url = url;
        }
        if let Ok(user) = std::env::var(ENV_USER) {
            self.platform.username = Some(user);
        }
        if let Ok(pass) = std::env::var(ENV_PASS) {
            self.platform.password = Some(pass);
        }
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        parse_base_url(&self.platform.base_url)?;

        let q = &self.query;
        if q.poll_interval_ms == 0 {
            return Err(Error::config("query.poll_interval_ms must be positive"));
        }
        if q.timeout_secs == 0 {
            return Err(Error::config("query.timeout_secs must be positive"));
        }
        if !(q.backoff_factor >= 1.0 && q.backoff_factor.is_finite()) {
            return Err(Error::config(format!(
                "query.backoff_factor must be a finite number >= 1.0, got {}",
                q.backoff_factor
            )));
        }
        if q.max_poll_interval_ms < q.poll_interval_ms {
            return Err(Error::config(
                "query.max_poll_interval_ms must not be smaller than query.poll_interval_ms",
            ));
        }
        if q.max_rows == 0 {
            return Err(Error::config("query.max_rows must be positive"));
        }
        if q.page_size == Some(0) {
            return Err(Error::config("query.page_size must be positive"));
        }
        Ok(())
    }

    /// Builds the immutable login identity.
    pub fn credentials(&self) -> Result<Credentials> {
        let username = self
            .platform
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::config(format!(
                    "No username configured (set platform.username or {ENV_USER})"
                ))
            })?;
        let password = self
            .platform
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::config(format!(
                    "No password configured (set platform.password or {ENV_PASS})"
                ))
            })?;
        let base_url = parse_base_url(&self.platform.base_url)?;

        Ok(Credentials::new(username, password, base_url))
    }

    /// Request timeout for the shared HTTP client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.platform.request_timeout_secs)
    }

    /// Expiry skew for the session manager.
    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.session.expiry_skew_secs)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::config(format!("Invalid base URL '{raw}': {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::config(format!(
            "Invalid scheme '{}'. Expected 'http' or 'https'",
            url.scheme()
        )));
    }
    Ok(url)
}
