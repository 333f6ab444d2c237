//! Session management for the platform API.
//!
//! Holds the configured identity ([`Credentials`]), the current token pair
//! ([`TokenState`]) and the [`SessionManager`] that logs in, refreshes and
//! hands out valid tokens to the rest of the crate.

mod manager;
mod token;

pub use manager::SessionManager;
pub use token::{TokenState, TokenSummary};

use secrecy::Secret;
use std::fmt;
use url::Url;

/// Login identity for the platform. Immutable once loaded.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Secret<String>,
    base_url: String,
}

impl Credentials {
    /// Creates credentials for the platform at `base_url`.
    pub fn new(username: impl Into<String>, password: impl Into<String>, base_url: Url) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Secret<String> {
        &self.password
    }

    /// API base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an API path such as `/auth/login`.
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .finish()
    }
}
