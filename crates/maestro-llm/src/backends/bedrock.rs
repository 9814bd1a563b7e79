use super::{classify_status, classify_transport};
use crate::provider::{Completion, CompletionRequest, LlmError, LlmResult, Provider};
use crate::sigv4::{self, SigningParams};
use maestro_config::LlmConfig;
use maestro_core::ChatRole;
use serde::Serialize;

/// AWS Bedrock runtime backend using the Converse API with SigV4 request
/// signing.
pub struct BedrockProvider {
    config: LlmConfig,
    http: reqwest::Client,
}

impl BedrockProvider {
    pub fn new(config: LlmConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn region(&self) -> &str {
        self.config.region.as_deref().unwrap_or("us-east-1")
    }

    fn host(&self) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region())
    }
}

#[derive(Serialize)]
struct ContentBlock<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[async_trait::async_trait]
impl Provider for BedrockProvider {
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let access_key_id = self
            .config
            .access_key_id
            .as_deref()
            .ok_or_else(|| LlmError::Auth("aws access key id missing".into()))?;
        let secret_access_key = self
            .config
            .secret_access_key
            .as_deref()
            .ok_or_else(|| LlmError::Auth("aws secret access key missing".into()))?;

        let messages: Vec<ApiMessage<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                content: vec![ContentBlock { text: &m.content }],
            })
            .collect();

        let mut body = serde_json::json!({
            "messages": messages,
            "inferenceConfig": {
                "maxTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = serde_json::json!([{ "text": system }]);
        }
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| LlmError::InvalidRequest(format!("request serialization: {e}")))?;

        let host = self.host();
        let canonical_path = format!(
            "/model/{}/converse",
            sigv4::uri_encode_segment(&self.config.model)
        );
        let signed = sigv4::sign(&SigningParams {
            access_key_id,
            secret_access_key,
            region: self.region(),
            service: "bedrock",
            host: &host,
            canonical_path: &canonical_path,
            body: &body_bytes,
            now: chrono::Utc::now(),
        });

        let url = format!("https://{host}{canonical_path}");
        let response = self
            .http
            .post(&url)
            .header("host", &host)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .header("authorization", &signed.authorization)
            .header("content-type", "application/json")
            .body(body_bytes)
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
        let content = parsed["output"]["message"]["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                LlmError::MalformedResponse("missing output.message.content[0].text".into())
            })?;

        Ok(Completion {
            text: content.to_string(),
            model: self.config.model.clone(),
            input_tokens: parsed["usage"]["inputTokens"].as_u64(),
            output_tokens: parsed["usage"]["outputTokens"].as_u64(),
        })
    }

    fn name(&self) -> &'static str {
        "bedrock"
    }
}
