//! Ollama adapter using the native `/api/chat` endpoint.
//!
//! The native endpoint is used instead of Ollama's OpenAI shim because only it
//! honours a per-request context window (`options.num_ctx`).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::openai::timeout_from_env;
use super::types::*;
use super::ChatProvider;

pub const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    /// Create from `OLLAMA_BASE_URL` / `OLLAMA_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let base_url =
            std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| OLLAMA_DEFAULT_BASE_URL.into());
        Self::with_config(base_url, timeout_from_env("OLLAMA_TIMEOUT_SECONDS"))
    }

    pub fn with_config(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for OllamaAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let api_req = OllamaChatRequest {
            model: &req.model,
            messages: &req.messages,
            stream: false,
            options: OllamaOptions {
                temperature: req.temperature,
                num_ctx: req.context_window,
            },
        };

        let response = self.client.post(self.chat_url()).json(&api_req).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed = serde_json::from_str::<OllamaChatResponse>(&body);

        if !status.is_success() {
            let ctx = ErrorContext::new().with_status(status.as_u16());
            let message = parsed
                .ok()
                .and_then(|p| p.error)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(ProviderError::provider_with_context(
                "ollama",
                message,
                status.as_u16() >= 500,
                ctx,
            ));
        }

        let parsed = parsed
            .map_err(|e| ProviderError::provider("ollama", format!("Invalid JSON: {e}"), false))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider("ollama", error, false));
        }

        let content = parsed
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::provider("ollama", "No message in response", false))?;

        Ok(ChatResponse {
            content,
            input_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(parsed.done_reason),
        })
    }
}
