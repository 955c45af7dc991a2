//! Credential acquisition for the git remote.
//!
//! Two variants behind one trait: a static token from configuration,
//! and an installation-based issuer that exchanges an app key for a
//! short-lived token over HTTPS and caches it until shortly before
//! expiry. This module is the only place credentials are read; they
//! travel as opaque [`Credential`] values and are never logged.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::GitError;

/// Refresh this long before the reported expiry.
const EXPIRY_SAFETY_MARGIN: chrono::Duration = chrono::Duration::seconds(60);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// An opaque secret. `Debug` and `Display` never reveal the value;
/// the single consumer calls [`Credential::reveal`] at the point the
/// value enters a git argument array.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_credential(&self) -> Result<Credential, GitError>;

    /// Cheap liveness probe: can this provider currently produce a
    /// usable credential?
    async fn verify_access(&self) -> bool;

    /// Last rate-limit signals observed from the issuer, if any.
    fn rate_limit_state(&self) -> RateLimitState;
}

// ── Static token ──────────────────────────────────────────────────────────────

pub struct StaticTokenProvider {
    token: Credential,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Credential::new(token),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn get_credential(&self) -> Result<Credential, GitError> {
        if self.token.is_empty() {
            return Err(GitError::Permanent("git token is not configured".to_string()));
        }
        Ok(self.token.clone())
    }

    async fn verify_access(&self) -> bool {
        !self.token.is_empty()
    }

    fn rate_limit_state(&self) -> RateLimitState {
        RateLimitState::default()
    }
}

// ── Installation issuer ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Mints short-lived credentials by POSTing the app key to the
/// issuer's exchange endpoint. The minted token is cached until
/// [`EXPIRY_SAFETY_MARGIN`] before its expiry.
pub struct InstallationAuthProvider {
    key_path: PathBuf,
    install_id: String,
    exchange_url: String,
    client: reqwest::Client,
    cached: Mutex<Option<(Credential, DateTime<Utc>)>>,
    rate: Mutex<RateLimitState>,
}

impl InstallationAuthProvider {
    pub fn new(
        key_path: impl Into<PathBuf>,
        install_id: impl Into<String>,
        exchange_url: impl Into<String>,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            install_id: install_id.into(),
            exchange_url: exchange_url.into(),
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
            rate: Mutex::new(RateLimitState::default()),
        }
    }

    fn cached_credential(&self) -> Option<Credential> {
        let cached = self.cached.lock().expect("credential cache lock");
        cached.as_ref().and_then(|(credential, expires_at)| {
            if *expires_at - EXPIRY_SAFETY_MARGIN > Utc::now() {
                Some(credential.clone())
            } else {
                None
            }
        })
    }

    fn record_rate_headers(&self, headers: &reqwest::header::HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
        };
        let mut rate = self.rate.lock().expect("rate state lock");
        if let Some(limit) = read("x-rate-limit-limit") {
            rate.limit = Some(limit);
        }
        if let Some(remaining) = read("x-rate-limit-remaining") {
            rate.remaining = Some(remaining);
        }
        if let Some(reset) = read("x-rate-limit-reset") {
            rate.reset_at = DateTime::from_timestamp(reset as i64, 0);
        }
    }

    async fn exchange(&self) -> Result<(Credential, DateTime<Utc>), GitError> {
        let app_key = tokio::fs::read_to_string(&self.key_path)
            .await
            .map_err(|e| GitError::Permanent(format!("cannot read app key file: {e}")))?;

        let response = self
            .client
            .post(&self.exchange_url)
            .timeout(EXCHANGE_TIMEOUT)
            .bearer_auth(app_key.trim())
            .json(&serde_json::json!({ "installation_id": self.install_id }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GitError::Timeout(EXCHANGE_TIMEOUT)
                } else {
                    GitError::Transient(format!("token exchange request failed: {e}"))
                }
            })?;

        self.record_rate_headers(response.headers());

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(GitError::Transient(format!("token exchange returned {status}")));
        }
        if !status.is_success() {
            return Err(GitError::Permanent(format!("token exchange returned {status}")));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| GitError::Permanent(format!("malformed token exchange response: {e}")))?;
        debug!(expires_at = %body.expires_at, "installation token minted");
        Ok((Credential::new(body.token), body.expires_at))
    }
}

#[async_trait]
impl AuthProvider for InstallationAuthProvider {
    async fn get_credential(&self) -> Result<Credential, GitError> {
        if let Some(credential) = self.cached_credential() {
            return Ok(credential);
        }
        let (credential, expires_at) = self.exchange().await?;
        *self.cached.lock().expect("credential cache lock") =
            Some((credential.clone(), expires_at));
        Ok(credential)
    }

    async fn verify_access(&self) -> bool {
        match self.get_credential().await {
            Ok(_) => true,
            Err(err) => {
                warn!(transient = err.is_transient(), "installation auth probe failed");
                false
            }
        }
    }

    fn rate_limit_state(&self) -> RateLimitState {
        self.rate.lock().expect("rate state lock").clone()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_never_reveals_the_secret() {
        let credential = Credential::new("hunter2-super-secret");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(rendered, "Credential(***)");
    }

    #[tokio::test]
    async fn static_provider_round_trips_its_token() {
        let provider = StaticTokenProvider::new("tok");
        assert!(provider.verify_access().await);
        assert_eq!(provider.get_credential().await.unwrap().reveal(), "tok");
    }

    #[tokio::test]
    async fn empty_static_token_is_a_permanent_error() {
        let provider = StaticTokenProvider::new("");
        assert!(!provider.verify_access().await);
        let err = provider.get_credential().await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn missing_key_file_is_permanent() {
        let provider = InstallationAuthProvider::new(
            "/nonexistent/key.pem",
            "42",
            "http://127.0.0.1:9/exchange",
        );
        let err = provider.get_credential().await.unwrap_err();
        assert!(!err.is_transient(), "missing key must not be retried: {err:?}");
    }

    #[test]
    fn fresh_cache_is_served_and_stale_cache_is_not() {
        let provider = InstallationAuthProvider::new("/dev/null", "42", "http://example.invalid");
        *provider.cached.lock().unwrap() = Some((
            Credential::new("fresh"),
            Utc::now() + chrono::Duration::minutes(10),
        ));
        assert_eq!(provider.cached_credential().unwrap().reveal(), "fresh");

        // Inside the safety margin counts as expired.
        *provider.cached.lock().unwrap() = Some((
            Credential::new("stale"),
            Utc::now() + chrono::Duration::seconds(30),
        ));
        assert!(provider.cached_credential().is_none());
    }
}
