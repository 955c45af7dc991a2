//! Paid-AI plumbing: usage accounting, provider fallback, embeddings,
//! and transcription.
//!
//! The flow for every AI call:
//!
//! ```text
//! caller ─▶ FallbackManager ─▶ TokenGovernor (mode gate)
//!                │
//!                ├─ normal            ─▶ primary, then secondary
//!                ├─ degraded/critical ─▶ secondary first
//!                └─ frozen            ─▶ deterministic local fallback
//! ```
//!
//! Every provider response reports token usage back to the governor,
//! which persists append-only usage records and derives the monthly
//! operating mode.

pub mod chat;
pub mod embedding;
pub mod fallback;
pub mod governor;
pub mod http;
pub mod transcription;

use notevault_security::ValidationError;

pub use chat::{TextBackend, TextResponse};
pub use embedding::{EmbedOutcome, EmbeddingAdapter, EmbeddingBackend, EmbeddingSettings};
pub use fallback::{FallbackManager, ProviderRateState, RequestClass, Routed};
pub use governor::{LimitCheck, ModeNotifyFn, OperatingMode, TokenGovernor, UsageReport};
pub use http::HttpAiBackend;
pub use transcription::{Transcript, TranscriptionAdapter, TranscriptionBackend};

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    /// 429, 5xx, network trouble, timeouts: worth retrying.
    #[error("retryable AI failure: {0}")]
    Retryable(String),
    /// Auth failures and malformed requests: retrying will not help.
    #[error("permanent AI failure: {0}")]
    Permanent(String),
    /// The provider reports its own quota exhausted (distinct from
    /// our governor's ceiling).
    #[error("provider quota exhausted: {0}")]
    Quota(String),
    /// Our own governor denied the call.
    #[error("monthly token ceiling reached (ratio {ratio:.2})")]
    CeilingReached { ratio: f64 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] notevault_store::StoreError),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AiError::Retryable(_))
    }

    /// Classify an HTTP status from an AI provider.
    pub fn from_status(status: u16, body_hint: &str) -> Self {
        let hint = body_hint.to_lowercase();
        if hint.contains("insufficient_quota") || hint.contains("quota exceeded") {
            return AiError::Quota(format!("provider returned {status}"));
        }
        match status {
            429 => AiError::Retryable(format!("provider rate limited ({status})")),
            s if s >= 500 => AiError::Retryable(format!("provider error ({s})")),
            s => AiError::Permanent(format!("provider rejected request ({s})")),
        }
    }
}
