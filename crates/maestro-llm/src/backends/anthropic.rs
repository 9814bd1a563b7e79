use super::{classify_status, classify_transport};
use crate::provider::{Completion, CompletionRequest, LlmError, LlmResult, Provider};
use maestro_config::LlmConfig;
use maestro_core::ChatRole;
use serde::Serialize;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic messages-API backend.
pub struct AnthropicProvider {
    config: LlmConfig,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: LlmConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let url = format!("{}/v1/messages", self.base_url());
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::Auth("anthropic api key missing".into()))?;

        // The messages API takes the system prompt out of band and only
        // user/assistant turns in the list.
        let messages: Vec<ApiMessage<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = serde_json::json!(system);
        }

        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        let content = parsed["content"][0]["text"]
            .as_str()
            .ok_or_else(|| LlmError::MalformedResponse("missing content[0].text".into()))?;

        Ok(Completion {
            text: content.to_string(),
            model: self.config.model.clone(),
            input_tokens: parsed["usage"]["input_tokens"].as_u64(),
            output_tokens: parsed["usage"]["output_tokens"].as_u64(),
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
