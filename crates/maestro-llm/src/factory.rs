use crate::backends::{AnthropicProvider, BedrockProvider, OllamaProvider, OpenAiProvider};
use crate::provider::Provider;
use maestro_config::{LlmConfig, LlmProvider};
use maestro_core::{MaestroError, MaestroResult};
use std::sync::Arc;

/// Builds providers from per-agent LLM configs.
///
/// Injected into the pools so tests can substitute mock providers for the
/// real HTTP backends.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &LlmConfig) -> MaestroResult<Arc<dyn Provider>>;
}

/// Factory over the real HTTP backends, sharing one connection pool.
pub struct DefaultProviderFactory {
    http: reqwest::Client,
}

impl DefaultProviderFactory {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, config: &LlmConfig) -> MaestroResult<Arc<dyn Provider>> {
        if config.requires_credentials() && !config.has_credentials() {
            return Err(MaestroError::Permanent(format!(
                "provider '{}' has no credentials configured",
                config.provider
            )));
        }
        let provider: Arc<dyn Provider> = match config.provider {
            LlmProvider::OpenAi => {
                Arc::new(OpenAiProvider::new(config.clone(), self.http.clone()))
            }
            LlmProvider::Anthropic => {
                Arc::new(AnthropicProvider::new(config.clone(), self.http.clone()))
            }
            LlmProvider::Bedrock => {
                Arc::new(BedrockProvider::new(config.clone(), self.http.clone()))
            }
            LlmProvider::Ollama => {
                Arc::new(OllamaProvider::new(config.clone(), self.http.clone()))
            }
        };
        Ok(provider)
    }
}
