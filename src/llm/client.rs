//! Chat-completions client for a LiteLLM proxy.
//!
//! Worker stages only ever send one system prompt and one user prompt and
//! read back a single completion, so [`ChatRequest`] and [`ChatReply`] carry
//! exactly that. Transient failures (rate limits, 5xx, transport errors) are
//! retried with the backoff of a swarm [`RetryPolicy`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::policy::RetryPolicy;

const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One stage call: a system prompt, a user prompt and sampling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// `None` uses the provider's default model.
    pub model: Option<String>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// The first completion of a chat call plus its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub model: String,
    pub text: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Anything that can answer a [`ChatRequest`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, LlmError>;

    fn default_model(&self) -> &str;
}

#[derive(Serialize)]
struct WireTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: [WireTurn<'a>; 2],
    temperature: f64,
    max_tokens: u32,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a ChatRequest, model: &'a str) -> Self {
        Self {
            model,
            messages: [
                WireTurn {
                    role: "system",
                    content: &request.system_prompt,
                },
                WireTurn {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}

impl WireReply {
    fn into_reply(self, requested_model: &str) -> Result<ChatReply, LlmError> {
        let choice = self.choices.into_iter().next().ok_or(LlmError::EmptyResponse)?;
        let text = choice.message.content.ok_or(LlmError::EmptyResponse)?;
        let usage = self.usage.unwrap_or(WireUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        Ok(ChatReply {
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            text,
            finish_reason: choice.finish_reason,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

/// Pulls `error.message` out of an OpenAI-style error body, falling back to
/// the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<WireErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

/// Retry settings for provider calls when none are configured.
pub fn default_llm_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 500,
        backoff_multiplier: 2.0,
        max_delay_ms: 8_000,
        retryable_errors: None,
    }
}

/// HTTP client for a LiteLLM (OpenAI-compatible) endpoint.
pub struct LiteLlmClient {
    endpoint: String,
    api_key: Option<String>,
    default_model: String,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl LiteLlmClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;
        let api_base = api_base.into();
        Ok(Self {
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
            default_model: default_model.into(),
            retry: default_llm_retry(),
            http,
        })
    }

    /// Builds a client from `LITELLM_API_BASE`, `LITELLM_API_KEY` and
    /// `SWARM_MODEL`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = std::env::var("LITELLM_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingApiBase)?;
        let api_key = std::env::var("LITELLM_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let model = std::env::var("SWARM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_base, api_key, model)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(&self, request: &ChatRequest, model: &str) -> Result<ChatReply, LlmError> {
        let mut http_request = self
            .http
            .post(&self.endpoint)
            .json(&WireRequest::from_request(request, model));
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited(error_message(&body)));
        }
        if !status.is_success() {
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message: error_message(&body),
            });
        }

        serde_json::from_str::<WireReply>(&body)
            .map_err(|e| LlmError::ParseError(e.to_string()))?
            .into_reply(model)
    }
}

#[async_trait]
impl ChatProvider for LiteLlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let mut retries = 0;
        loop {
            match self.send_once(request, model).await {
                Ok(reply) => {
                    debug!(
                        model = %reply.model,
                        prompt_tokens = reply.prompt_tokens,
                        completion_tokens = reply.completion_tokens,
                        retries,
                        "Chat completion received"
                    );
                    return Ok(reply);
                }
                Err(err) => {
                    let Some(category) = err.transient_category() else {
                        return Err(err);
                    };
                    if !self.retry.should_retry(retries, category) {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_attempt(retries);
                    warn!(
                        model = %model,
                        category,
                        error = %err,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient LLM failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
