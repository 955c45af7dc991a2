//! Text-completion backend used for note synthesis and tag
//! suggestions.

use async_trait::async_trait;

use crate::AiError;

#[derive(Debug, Clone, PartialEq)]
pub struct TextResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<TextResponse, AiError>;
}

#[async_trait]
impl TextBackend for crate::http::HttpAiBackend {
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<TextResponse, AiError> {
        self.complete_http(provider, model, prompt).await
    }
}
