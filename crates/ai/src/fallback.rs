//! Provider routing with governed degradation.
//!
//! Wraps every AI call in the primary → secondary → local strategy.
//! The token governor's operating mode gates admission; provider
//! errors classified retryable (or provider-side quota) fall through
//! to the next provider, permanent errors propagate immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::AiError;
use crate::governor::{OperatingMode, TokenGovernor};

/// Who asked for this call; decides admission under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Direct response to a user command; allowed until frozen.
    UserInitiated,
    /// System-driven work (embeddings, reconciliation); disabled in
    /// critical mode.
    Background,
    /// Nice-to-have (auto tag suggestions); disabled in degraded mode.
    NonEssential,
}

/// Result of a routed call; `provider` is `None` when the local
/// fallback produced the value without any network call.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed<T> {
    pub value: T,
    pub provider: Option<String>,
}

impl<T> Routed<T> {
    pub fn is_degraded(&self) -> bool {
        self.provider.is_none()
    }
}

/// Rate-limit signals as reported by provider response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRateState {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

pub struct FallbackManager {
    governor: Arc<TokenGovernor>,
    primary: String,
    secondary: Option<String>,
    rate: Mutex<HashMap<String, ProviderRateState>>,
}

impl FallbackManager {
    pub fn new(governor: Arc<TokenGovernor>, primary: String, secondary: Option<String>) -> Self {
        let secondary = secondary.filter(|s| !s.is_empty() && *s != primary);
        Self {
            governor,
            primary,
            secondary,
            rate: Mutex::new(HashMap::new()),
        }
    }

    pub fn governor(&self) -> &Arc<TokenGovernor> {
        &self.governor
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Record rate-limit headers observed on a provider response.
    pub fn report_rate_state(&self, provider: &str, state: ProviderRateState) {
        self.rate
            .lock()
            .expect("rate map lock")
            .insert(provider.to_string(), state);
    }

    pub fn rate_state(&self, provider: &str) -> ProviderRateState {
        self.rate
            .lock()
            .expect("rate map lock")
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Run `op` against the selected provider chain, or fall back to
    /// the deterministic `local` response when the governor forbids
    /// paid calls for this request class.
    pub async fn execute<T, F, Fut, L>(
        &self,
        class: RequestClass,
        op: F,
        local: L,
    ) -> Result<Routed<T>, AiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
        L: FnOnce() -> T,
    {
        let check = self.governor.check_limits(&self.primary);
        let gated = match check.mode {
            OperatingMode::Frozen => true,
            OperatingMode::Critical => class != RequestClass::UserInitiated,
            OperatingMode::Degraded => class == RequestClass::NonEssential,
            OperatingMode::Normal => false,
        };
        if gated {
            debug!(mode = ?check.mode, class = ?class, "AI call served by local fallback");
            return Ok(Routed {
                value: local(),
                provider: None,
            });
        }

        // Under pressure, prefer the secondary so remaining primary
        // budget is saved for user-initiated work.
        let mut providers: Vec<String> = Vec::with_capacity(2);
        let stressed = matches!(check.mode, OperatingMode::Degraded | OperatingMode::Critical);
        match (&self.secondary, stressed) {
            (Some(secondary), true) => {
                providers.push(secondary.clone());
                providers.push(self.primary.clone());
            }
            (Some(secondary), false) => {
                providers.push(self.primary.clone());
                providers.push(secondary.clone());
            }
            (None, _) => providers.push(self.primary.clone()),
        }

        let mut last_error = None;
        for provider in providers {
            match op(provider.clone()).await {
                Ok(value) => {
                    return Ok(Routed {
                        value,
                        provider: Some(provider),
                    });
                }
                Err(err @ (AiError::Retryable(_) | AiError::Quota(_))) => {
                    warn!(provider, error = %err, "provider failed, trying next");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| AiError::Permanent("no provider configured".to_string())))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use notevault_store::{Store, StoreOptions};

    async fn governor_with_usage(limit: u64, used: u64) -> Arc<TokenGovernor> {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let governor = TokenGovernor::new(store, limit, chrono_tz::UTC).await.unwrap();
        if used > 0 {
            governor
                .record_usage("primary", "m", used, 0, "test", None)
                .await
                .unwrap();
        }
        Arc::new(governor)
    }

    fn manager(governor: Arc<TokenGovernor>, secondary: Option<&str>) -> FallbackManager {
        FallbackManager::new(
            governor,
            "primary".to_string(),
            secondary.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn normal_mode_uses_primary() {
        let m = manager(governor_with_usage(1000, 0).await, Some("secondary"));
        let routed = m
            .execute(
                RequestClass::Background,
                |provider| async move { Ok::<_, AiError>(provider) },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(routed.provider.as_deref(), Some("primary"));
        assert_eq!(routed.value, "primary");
    }

    #[tokio::test]
    async fn retryable_failure_falls_through_to_secondary() {
        let m = manager(governor_with_usage(1000, 0).await, Some("secondary"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let routed = m
            .execute(
                RequestClass::UserInitiated,
                move |provider| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if provider == "primary" {
                            Err(AiError::Retryable("503".to_string()))
                        } else {
                            Ok(provider)
                        }
                    }
                },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(routed.provider.as_deref(), Some("secondary"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_propagates_without_fallback() {
        let m = manager(governor_with_usage(1000, 0).await, Some("secondary"));
        let err = m
            .execute(
                RequestClass::UserInitiated,
                |_provider| async { Err::<String, _>(AiError::Permanent("401".to_string())) },
                || "local".to_string(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Permanent(_)));
    }

    #[tokio::test]
    async fn frozen_mode_returns_local_without_any_provider_call() {
        let m = manager(governor_with_usage(1000, 1000).await, Some("secondary"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let routed = m
            .execute(
                RequestClass::UserInitiated,
                move |_provider| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok("network".to_string())
                    }
                },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert!(routed.is_degraded());
        assert_eq!(routed.value, "local");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "frozen must not touch providers");
    }

    #[tokio::test]
    async fn critical_mode_gates_background_but_not_user_calls() {
        // 950/1000 = critical.
        let m = manager(governor_with_usage(1000, 950).await, None);

        let background = m
            .execute(
                RequestClass::Background,
                |provider| async move { Ok::<_, AiError>(provider) },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert!(background.is_degraded());

        let user = m
            .execute(
                RequestClass::UserInitiated,
                |provider| async move { Ok::<_, AiError>(provider) },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(user.provider.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn degraded_mode_gates_nonessential_and_prefers_secondary() {
        // 900/1000 = degraded.
        let m = manager(governor_with_usage(1000, 900).await, Some("secondary"));

        let tags = m
            .execute(
                RequestClass::NonEssential,
                |provider| async move { Ok::<_, AiError>(provider) },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert!(tags.is_degraded());

        let embed = m
            .execute(
                RequestClass::Background,
                |provider| async move { Ok::<_, AiError>(provider) },
                || "local".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(embed.provider.as_deref(), Some("secondary"));
    }

    #[tokio::test]
    async fn rate_state_round_trips() {
        let m = manager(governor_with_usage(1000, 0).await, None);
        let state = ProviderRateState {
            limit: Some(100),
            remaining: Some(4),
            reset_at: None,
        };
        m.report_rate_state("primary", state.clone());
        assert_eq!(m.rate_state("primary"), state);
        assert_eq!(m.rate_state("unknown"), ProviderRateState::default());
    }
}
