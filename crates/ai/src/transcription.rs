//! Voice-note transcription.
//!
//! Audio blobs are size-capped, spooled to a temp file that is deleted
//! on every exit path (the guard's drop), and routed through the
//! fallback manager. In frozen mode the caller gets the fixed
//! quota-exhausted placeholder instead of a provider call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use notevault_security::ValidationError;

use crate::AiError;
use crate::fallback::{FallbackManager, RequestClass};

pub const QUOTA_PLACEHOLDER: &str = "[transcription unavailable: monthly quota reached]";

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeResponse {
    pub text: String,
    pub confidence: Option<f32>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(
        &self,
        provider: &str,
        model: &str,
        audio_path: &Path,
        mime: &str,
    ) -> Result<TranscribeResponse, AiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f32>,
    /// True when the governor forbade the call and the placeholder
    /// text was returned.
    pub degraded: bool,
}

pub struct TranscriptionAdapter {
    fallback: Arc<FallbackManager>,
    backend: Arc<dyn TranscriptionBackend>,
    model: String,
    max_bytes: u64,
    tmp_dir: PathBuf,
}

impl TranscriptionAdapter {
    pub fn new(
        fallback: Arc<FallbackManager>,
        backend: Arc<dyn TranscriptionBackend>,
        model: impl Into<String>,
        max_bytes: u64,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fallback,
            backend,
            model: model.into(),
            max_bytes,
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Transcribe one audio blob. Voice capture is a user action, so
    /// the call is admitted until the budget freezes entirely.
    pub async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcript, AiError> {
        if audio.len() as u64 > self.max_bytes {
            return Err(ValidationError::AudioTooLarge {
                bytes: audio.len() as u64,
                limit: self.max_bytes,
            }
            .into());
        }

        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|e| AiError::Permanent(format!("tmp dir unavailable: {e}")))?;
        // The guard deletes the file when it drops, on success and on
        // every error path out of this function.
        let guard = tempfile::Builder::new()
            .prefix("audio-")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| AiError::Permanent(format!("tmp file creation failed: {e}")))?;
        tokio::fs::write(guard.path(), audio)
            .await
            .map_err(|e| AiError::Retryable(format!("tmp file write failed: {e}")))?;
        debug!(bytes = audio.len(), mime, "audio spooled for transcription");

        let backend = Arc::clone(&self.backend);
        let model = self.model.clone();
        let mime_owned = mime.to_string();
        let audio_path = guard.path().to_path_buf();
        let routed = self
            .fallback
            .execute(
                RequestClass::UserInitiated,
                move |provider| {
                    let backend = Arc::clone(&backend);
                    let model = model.clone();
                    let mime = mime_owned.clone();
                    let path = audio_path.clone();
                    async move { backend.transcribe(&provider, &model, &path, &mime).await }
                },
                || TranscribeResponse {
                    text: QUOTA_PLACEHOLDER.to_string(),
                    confidence: None,
                    input_tokens: 0,
                    output_tokens: 0,
                },
            )
            .await?;

        if let Some(provider) = &routed.provider {
            self.fallback
                .governor()
                .record_usage(
                    provider,
                    &self.model,
                    routed.value.input_tokens,
                    routed.value.output_tokens,
                    "transcribe",
                    None,
                )
                .await?;
        }

        Ok(Transcript {
            text: routed.value.text,
            confidence: routed.value.confidence,
            degraded: routed.provider.is_none(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
