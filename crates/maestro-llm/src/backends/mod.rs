pub mod anthropic;
pub mod bedrock;
pub mod ollama;
pub mod openai;

use crate::provider::LlmError;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Map an HTTP status plus response body onto the error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    let detail = format!("{status}: {body}");
    if status.as_u16() == 429 {
        LlmError::RateLimited(detail)
    } else if status.is_server_error() {
        LlmError::Server(detail)
    } else if matches!(status.as_u16(), 401 | 403) {
        LlmError::Auth(detail)
    } else {
        LlmError::InvalidRequest(detail)
    }
}

/// Map a transport-level failure onto the error taxonomy.
pub(crate) fn classify_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, ""),
            LlmError::Server(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, ""),
            LlmError::InvalidRequest(_)
        ));
    }
}
