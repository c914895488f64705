//! Bearer token exchange.
//!
//! The registry's token endpoint is asked for `pull` access on one
//! repository. The resulting [`AccessToken`] authorizes the manifest and
//! blob requests of the same run; it is never renewed.

use crate::constants::DEFAULT_TOKEN_TTL_SECS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

/// Short-lived bearer credential for one repository scope.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    issued_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, ttl_seconds: u64) -> Self {
        Self {
            value: value.into(),
            issued_at,
            ttl_seconds,
        }
    }

    /// Raw token value for the `Authorization: Bearer` header.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Instant after which the registry will reject the token.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns `true` once `now` has reached the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Fails with [`Error::Auth`] when the token has expired at `now`.
    pub fn ensure_valid(&self, repository: &str, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired(now) {
            return Err(Error::Auth {
                repository: repository.to_string(),
                reason: format!("bearer token expired at {}", self.expires_at()),
                status: None,
            });
        }
        Ok(())
    }
}

// Keeps the token value out of logs.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

/// JSON body returned by the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    /// Converts the response into an [`AccessToken`].
    ///
    /// `token` is preferred over `access_token`; missing `expires_in` and
    /// `issued_at` fall back to the distribution default TTL and `received_at`.
    pub fn into_token(self, repository: &str, received_at: DateTime<Utc>) -> Result<AccessToken> {
        let value = self
            .token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| Error::Auth {
                repository: repository.to_string(),
                reason: "token response carries no token".to_string(),
                status: None,
            })?;

        Ok(AccessToken::new(
            value,
            self.issued_at.unwrap_or(received_at),
            self.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
        ))
    }
}

/// Exchanges a repository scope for a bearer credential.
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Requests `pull` access on `repository`.
    async fn fetch_token(&self, repository: &str) -> Result<AccessToken>;
}
