//! Access/refresh token pair with expiry metadata.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use std::fmt;

/// The token pair issued by the platform.
///
/// Never edited in place: the session manager swaps in a new `TokenState`
/// on every login or refresh.
pub struct TokenState {
    access_token: Secret<String>,
    refresh_token: Option<Secret<String>>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Builds a token issued at `issued_at`.
    ///
    /// `expires_at` comes from the declared lifetime, else from the JWT `exp`
    /// claim, else equals `issued_at` so the token counts as already expired.
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        expires_in: Option<Duration>,
    ) -> Self {
        let expires_at = match expires_in {
            Some(lifetime) => issued_at
                .checked_add_signed(lifetime.max(Duration::zero()))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => jwt_expiry(&access_token).unwrap_or(issued_at),
        };

        Self {
            access_token: Secret::new(access_token),
            refresh_token: refresh_token.map(Secret::new),
            issued_at,
            expires_at,
        }
    }

    /// Bearer credential for the `Authorization` header.
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn refresh_token(&self) -> Option<&Secret<String>> {
        self.refresh_token.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True while the token is usable with `skew` to spare.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now < self.expires_at - skew
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True if both values describe the same issued token.
    pub fn same_token(&self, other: &TokenState) -> bool {
        self.issued_at == other.issued_at
            && self.access_token.expose_secret() == other.access_token.expose_secret()
    }

    /// Secret-free view for status reporting.
    pub fn summary(&self, now: DateTime<Utc>) -> TokenSummary {
        TokenSummary {
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            expires_in_secs: (self.expires_at - now).num_seconds().max(0),
            has_refresh_token: self.refresh_token.is_some(),
            expired: self.is_expired(now),
        }
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token metadata that is safe to hand to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: i64,
    pub has_refresh_token: bool,
    pub expired: bool,
}

/// Reads the `exp` claim of a JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}
