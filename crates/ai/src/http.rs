//! HTTPS/JSON backends for the embedding and transcription traits.
//!
//! The wire contract is host-abstract: `POST {base}/embed` with
//! `{model, input}` returning `{embeddings, usage}`, and
//! `POST {base}/transcribe` with the raw audio body. Base URLs and API
//! keys resolve from the environment per provider
//! (`<PROVIDER>_BASE_URL`, `<PROVIDER>_API_KEY`). Rate-limit headers
//! are parsed and reported to the fallback manager; response bodies
//! never leak into errors or logs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use tracing::debug;

use crate::AiError;
use crate::embedding::{EmbedResponse, EmbeddingBackend};
use crate::fallback::{FallbackManager, ProviderRateState};
use crate::transcription::{TranscribeResponse, TranscriptionBackend};

/// Deadline for any single AI request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpAiBackend {
    client: reqwest::Client,
    /// Receives observed rate-limit headers, when wired.
    rate_sink: Option<Arc<FallbackManager>>,
}

impl HttpAiBackend {
    pub fn new(rate_sink: Option<Arc<FallbackManager>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rate_sink,
        }
    }

    fn base_url(provider: &str) -> Result<String, AiError> {
        let env_key = format!("{}_BASE_URL", provider.to_uppercase().replace('-', "_"));
        if let Ok(url) = std::env::var(&env_key) {
            if !url.is_empty() {
                return Ok(url.trim_end_matches('/').to_string());
            }
        }
        match provider {
            "openai" => Ok("https://api.openai.com/v1".to_string()),
            "anthropic" => Ok("https://api.anthropic.com/v1".to_string()),
            "gemini" => Ok("https://generativelanguage.googleapis.com/v1beta".to_string()),
            other => Err(AiError::Permanent(format!(
                "no base URL for provider {other:?} (set {env_key})"
            ))),
        }
    }

    fn api_key(provider: &str) -> Result<String, AiError> {
        let env_key = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
        match std::env::var(&env_key) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(AiError::Permanent(format!("missing API key ({env_key})"))),
        }
    }

    fn observe_rate_headers(&self, provider: &str, headers: &reqwest::header::HeaderMap) {
        let Some(sink) = &self.rate_sink else { return };
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        let state = ProviderRateState {
            limit: read("x-rate-limit-limit"),
            remaining: read("x-rate-limit-remaining"),
            reset_at: read("x-rate-limit-reset")
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
        };
        if state != ProviderRateState::default() {
            sink.report_rate_state(provider, state);
        }
    }

    fn map_send_error(err: reqwest::Error) -> AiError {
        if err.is_timeout() {
            AiError::Retryable("request deadline exceeded".to_string())
        } else if err.is_connect() {
            AiError::Retryable("connection failed".to_string())
        } else {
            AiError::Retryable(format!("request failed: {}", err.without_url()))
        }
    }
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default = "default_usage")]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireTranscribeResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default = "default_usage")]
    usage: WireUsage,
}

fn default_usage() -> WireUsage {
    WireUsage {
        input_tokens: 0,
        output_tokens: 0,
    }
}

#[derive(Deserialize)]
struct WireTextResponse {
    text: String,
    #[serde(default = "default_usage")]
    usage: WireUsage,
}

impl HttpAiBackend {
    pub(crate) async fn complete_http(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<crate::chat::TextResponse, AiError> {
        let base = Self::base_url(provider)?;
        let key = Self::api_key(provider)?;
        let response = self
            .client
            .post(format!("{base}/chat"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(key)
            .json(&serde_json::json!({ "model": model, "input": prompt }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        self.observe_rate_headers(provider, response.headers());
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::from_status(status.as_u16(), &body));
        }
        let body: WireTextResponse = response
            .json()
            .await
            .map_err(|_| AiError::Permanent("malformed completion response".to_string()))?;
        Ok(crate::chat::TextResponse {
            text: body.text,
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpAiBackend {
    async fn embed(
        &self,
        provider: &str,
        model: &str,
        inputs: &[String],
    ) -> Result<EmbedResponse, AiError> {
        let base = Self::base_url(provider)?;
        let key = Self::api_key(provider)?;
        let response = self
            .client
            .post(format!("{base}/embed"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(key)
            .json(&serde_json::json!({ "model": model, "input": inputs }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        self.observe_rate_headers(provider, response.headers());
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::from_status(status.as_u16(), &body));
        }

        let body: WireEmbedResponse = response
            .json()
            .await
            .map_err(|_| AiError::Permanent("malformed embedding response".to_string()))?;
        debug!(provider, model, count = body.embeddings.len(), "embeddings received");
        Ok(EmbedResponse {
            vectors: body.embeddings,
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
        })
    }
}

#[async_trait]
impl TranscriptionBackend for HttpAiBackend {
    async fn transcribe(
        &self,
        provider: &str,
        model: &str,
        audio_path: &Path,
        mime: &str,
    ) -> Result<TranscribeResponse, AiError> {
        let base = Self::base_url(provider)?;
        let key = Self::api_key(provider)?;
        let audio = tokio::fs::read(audio_path)
            .await
            .map_err(|e| AiError::Retryable(format!("cannot read spooled audio: {e}")))?;

        let response = self
            .client
            .post(format!("{base}/transcribe"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(key)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .header("x-model", model)
            .body(audio)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        self.observe_rate_headers(provider, response.headers());
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::from_status(status.as_u16(), &body));
        }

        let body: WireTranscribeResponse = response
            .json()
            .await
            .map_err(|_| AiError::Permanent("malformed transcription response".to_string()))?;
        Ok(TranscribeResponse {
            text: body.text,
            confidence: body.confidence,
            input_tokens: body.usage.input_tokens,
            output_tokens: body.usage.output_tokens,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_without_base_url_is_permanent() {
        let err = HttpAiBackend::base_url("definitely-not-configured-zz").unwrap_err();
        assert!(matches!(err, AiError::Permanent(_)));
    }

    #[test]
    fn status_classification_matches_the_taxonomy() {
        assert!(matches!(AiError::from_status(429, ""), AiError::Retryable(_)));
        assert!(matches!(AiError::from_status(503, ""), AiError::Retryable(_)));
        assert!(matches!(AiError::from_status(401, ""), AiError::Permanent(_)));
        assert!(matches!(AiError::from_status(400, ""), AiError::Permanent(_)));
        assert!(matches!(
            AiError::from_status(429, r#"{"error":{"code":"insufficient_quota"}}"#),
            AiError::Quota(_)
        ));
    }
}
