//! Language model provider.
//!
//! The agent only sees the `LanguageModel` trait. The production
//! implementation speaks the OpenAI-compatible Chat Completions API and
//! retries transient failures (max 4 attempts, exponential backoff).

use super::responder::ModelReply;
use crate::config::Config;
use crate::memory::{ContentBlock, Role};
use crate::{KibitzError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Appended to the system prompt when structured output is requested
const STRUCTURED_INSTRUCTIONS: &str = "Answer with JSON only: \
{\"messages\": [{\"text\": \"...\", \"reply_to\": \"username or null\"}]}. \
Use several short messages instead of one long one when it reads more naturally.";

/// One generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub blocks: Vec<ContentBlock>,
    pub temperature: f32,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    /// Ask for `{"messages": [...]}` instead of free text
    pub structured: bool,
}

impl GenerationRequest {
    /// Request with the sampling parameters from config
    pub fn from_config(config: &Config, model: String, blocks: Vec<ContentBlock>) -> Self {
        Self {
            model,
            blocks,
            temperature: config.ai.temperature,
            top_k: config.ai.top_k,
            top_p: config.ai.top_p,
            structured: config.ai.structured_output,
        }
    }

    pub fn prompt_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.content.len()).sum()
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a reply. Any failure is a single `Provider` error;
    /// there are no partial results.
    async fn generate(&self, request: &GenerationRequest) -> Result<ModelReply>;
}

// ─── Chat Completions API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ContentBlock],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─── Client ─────────────────────────────────────────────────────────

pub struct ChatCompletionsClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("kibitz/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KibitzError::Provider(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key();
        if api_key.is_none() {
            warn!(
                "{} is not set, requests will be sent without authorization",
                config.ai.api_key_env
            );
        }
        Self::new(&config.ai.base_url, api_key)
    }

    /// Exponential backoff with a little deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    fn is_retryable_error(msg: &str) -> bool {
        msg.contains("timeout")
            || msg.contains("network")
            || msg.contains("retryable")
            || msg.contains("error sending request")
            || msg.contains("connection")
    }

    fn build_messages(request: &GenerationRequest) -> Vec<ContentBlock> {
        let mut messages = request.blocks.clone();
        if !request.structured {
            return messages;
        }
        if messages.first().is_some_and(|b| b.role == Role::System) {
            messages[0].content.push_str("\n\n");
            messages[0].content.push_str(STRUCTURED_INSTRUCTIONS);
        } else {
            messages.insert(0, ContentBlock::system(STRUCTURED_INSTRUCTIONS));
        }
        messages
    }

    async fn send_request(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let messages = Self::build_messages(request);

        let body = ChatRequest {
            model: &request.model,
            messages: &messages,
            temperature: request.temperature,
            top_k: request.top_k,
            top_p: request.top_p,
            response_format: request.structured.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            stream: false,
        };

        let mut req_builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let response = req_builder
            .json(&body)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let response = Self::check_response_status(response).await?;

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| KibitzError::Provider(e.to_string()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| KibitzError::Provider("response has no content".to_string()))
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = Self::extract_error_detail(&body);
        let prefix = if status.is_server_error() {
            "retryable API error"
        } else {
            "API error"
        };
        if detail.is_empty() {
            return Err(KibitzError::Provider(format!("{prefix} {status}")));
        }
        Err(KibitzError::Provider(format!("{prefix} {status}: {detail}")))
    }

    fn extract_error_detail(body: &str) -> String {
        let trimmed = body.trim();
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(msg) = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
            {
                return msg.to_string();
            }
        }
        trimmed.chars().take(500).collect()
    }

    fn map_reqwest_error(e: reqwest::Error) -> KibitzError {
        if e.is_timeout() {
            KibitzError::Provider(format!("timeout: {e}"))
        } else if e.is_connect() {
            KibitzError::Provider(format!("network: {e}"))
        } else {
            KibitzError::Provider(e.to_string())
        }
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<ModelReply> {
        debug!(
            "Calling {} with {} blocks ({} bytes)",
            request.model,
            request.blocks.len(),
            request.prompt_bytes()
        );

        let mut last_err = None;
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                let delay = Self::retry_backoff(attempt);
                warn!(
                    "Model request failed (attempt {}/{}), retrying in {:?}...",
                    attempt, MAX_RETRY_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(request).await {
                Ok(content) => return Ok(ModelReply::Text(content)),
                Err(e) => {
                    if Self::is_retryable_error(&e.to_string()) && attempt + 1 < MAX_RETRY_ATTEMPTS {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| KibitzError::Provider("all retry attempts exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(structured: bool) -> GenerationRequest {
        GenerationRequest {
            model: "m".to_string(),
            blocks: vec![ContentBlock::system("Be nice."), ContentBlock::user("Ann: hi\n")],
            temperature: 0.5,
            top_k: None,
            top_p: Some(0.9),
            structured,
        }
    }

    #[test]
    fn test_retry_backoff_grows() {
        let first = ChatCompletionsClient::retry_backoff(1);
        let third = ChatCompletionsClient::retry_backoff(3);
        assert!(first.as_millis() >= 180 && first.as_millis() <= 220);
        assert!(third > first);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ChatCompletionsClient::is_retryable_error("timeout: deadline"));
        assert!(ChatCompletionsClient::is_retryable_error("retryable API error 502"));
        assert!(!ChatCompletionsClient::is_retryable_error("API error 401"));
    }

    #[test]
    fn test_structured_instructions_extend_system_block() {
        let messages = ChatCompletionsClient::build_messages(&request(true));
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.starts_with("Be nice."));
        assert!(messages[0].content.contains("\"messages\""));

        let plain = ChatCompletionsClient::build_messages(&request(false));
        assert_eq!(plain[0].content, "Be nice.");
    }

    #[test]
    fn test_request_serialization_skips_unset_sampling() {
        let request = request(true);
        let body = ChatRequest {
            model: &request.model,
            messages: &request.blocks,
            temperature: request.temperature,
            top_k: request.top_k,
            top_p: request.top_p,
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("top_k").is_none());
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn test_error_detail_prefers_message() {
        let detail =
            ChatCompletionsClient::extract_error_detail(r#"{"error": {"message": "bad key"}}"#);
        assert_eq!(detail, "bad key");
    }
}
