//! OpenAI-compatible chat-completion client used for habitability narratives.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::LlmConfig;

/// Abstraction over chat-completion providers.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send a single user prompt and return the assistant's text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Response contained no message content")]
    EmptyResponse,

    #[error("All {attempts} attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

// ============================================================================
// Wire types (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiChatClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: Client,
    config: LlmConfig,
    api_key: String,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(body);
            tracing::error!(code = status.as_u16(), message = %message, "Chat completion API error");
            return Err(LlmError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let attempts = self.config.max_retries + 1;
        Retry::start(retry_strategy, || self.complete_once(prompt))
            .await
            .map_err(|e| {
                tracing::error!(attempts = attempts, error = %e, "All chat completion attempts failed");
                LlmError::RetryExhausted {
                    attempts,
                    last: e.to_string(),
                }
            })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: Some("test-key".to_string()),
            max_retries: 1,
            retry_delay_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_api_key() {
        let config = LlmConfig::default();
        assert!(matches!(OpenAiChatClient::new(config), Err(LlmError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "openai/gpt-4o-mini",
                "max_tokens": 500,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "HABITABILITY SCORE: 12%"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(test_config(server.uri())).unwrap();
        let text = client.complete("hello").await.unwrap();
        assert_eq!(text, "HABITABILITY SCORE: 12%");
    }

    #[tokio::test]
    async fn test_api_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "rate limited"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(test_config(server.uri())).unwrap();
        let err = client.complete("hello").await.unwrap_err();
        match err {
            LlmError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("rate limited"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenAiChatClient::new(test_config(server.uri())).unwrap();
        assert!(client.complete("hello").await.is_err());
    }
}
