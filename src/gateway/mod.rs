//! Provider gateway for chat completions against OpenAI, Ollama and vLLM.

pub mod error;
pub mod ollama;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use ollama::OllamaAdapter;
use openai::OpenAiAdapter;
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// What the pipeline stages depend on: one completion per request.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// A single transport. Implemented by each backend adapter.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// The closed set of transports a run can use.
#[derive(Debug, Clone)]
pub enum Backend {
    /// OpenAI wire format; covers both hosted OpenAI and vLLM.
    OpenAiCompatible(OpenAiAdapter),
    Ollama(OllamaAdapter),
}

impl Backend {
    /// Build the transport for `kind` from environment variables.
    pub fn from_env(kind: BackendKind) -> Result<Self, ProviderError> {
        Ok(match kind {
            BackendKind::OpenAi => Backend::OpenAiCompatible(OpenAiAdapter::openai_from_env()?),
            BackendKind::Vllm => Backend::OpenAiCompatible(OpenAiAdapter::vllm_from_env()?),
            BackendKind::Ollama => Backend::Ollama(OllamaAdapter::from_env()?),
        })
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Backend::OpenAiCompatible(a) => a.provider(),
            Backend::Ollama(_) => "ollama",
        }
    }
}

#[async_trait]
impl ChatProvider for Backend {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self {
            Backend::OpenAiCompatible(a) => a.chat(req).await,
            Backend::Ollama(a) => a.chat(req).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    backend: Backend,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(kind: BackendKind, usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        Ok(Self {
            backend: Backend::from_env(kind)?,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(backend: Backend, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            backend,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.backend.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, attempt, None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, &ChatResponse::empty(), attempt, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    tracing::warn!(
                        provider = self.backend.provider(),
                        attempt,
                        code = err.code(),
                        "retrying after {delay:?}: {err}"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider(self.backend.provider(), "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            self.backend.provider(),
            req.model.clone(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .latency(resp.latency.as_millis() as u64)
        .subject(req.attribution.subject_id.clone())
        .attempt(attempt);

        let record = match error_code {
            Some(code) => record.error(code),
            None => record,
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
