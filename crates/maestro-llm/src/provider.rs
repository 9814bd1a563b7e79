use async_trait::async_trait;
use maestro_config::LlmConfig;
use maestro_core::{ChatMessage, MaestroError};
use thiserror::Error;

pub type LlmResult<T> = Result<T, LlmError>;

/// Provider-call failures, split by retry policy.
///
/// Transient kinds (rate limit, server error, network, timeout) map to
/// `MaestroError::Transient` so the bus retries with backoff; the rest are
/// permanent and fail the execution immediately.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported provider: {0}")]
    Unsupported(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_)
                | LlmError::Server(_)
                | LlmError::Network(_)
                | LlmError::Timeout(_)
        )
    }
}

impl From<LlmError> for MaestroError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            MaestroError::Transient(err.to_string())
        } else {
            MaestroError::Permanent(err.to_string())
        }
    }
}

/// One completion request: system prompt plus an ordered conversation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Request with the sampling parameters taken from an agent's LLM
    /// config.
    pub fn new(config: &LlmConfig, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_prompt: None,
            messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.is_empty() {
            self.system_prompt = Some(prompt);
        }
        self
    }
}

/// A provider's answer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// The provider capability: one blocking completion per call. Streaming and
/// token accounting beyond what the API reports are provider concerns kept
/// out of the contract.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion>;
    fn name(&self) -> &'static str;
}
