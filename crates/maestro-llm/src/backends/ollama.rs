use super::{classify_status, classify_transport};
use crate::provider::{Completion, CompletionRequest, LlmError, LlmResult, Provider};
use maestro_config::LlmConfig;
use maestro_core::ChatRole;
use serde::Serialize;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local Ollama backend; no credentials.
pub struct OllamaProvider {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OllamaProvider {
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
impl Provider for OllamaProvider {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let url = format!("{}/api/chat", self.base_url());

        let mut messages: Vec<ApiMessage<'_>> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        for message in &request.messages {
            messages.push(ApiMessage {
                role: match message.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: &message.content,
            });
        }

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .http
            .post(&url)
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
        let content = parsed["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::MalformedResponse("missing message.content".into()))?;

        Ok(Completion {
            text: content.to_string(),
            model: self.config.model.clone(),
            input_tokens: parsed["prompt_eval_count"].as_u64(),
            output_tokens: parsed["eval_count"].as_u64(),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
