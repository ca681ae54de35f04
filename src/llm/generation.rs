//! Generation service used by worker stages.
//!
//! [`GenerationService`] is the narrow contract a pipeline stage needs:
//! system prompt and user prompt in, text plus accounting out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::client::{ChatProvider, ChatRequest};
use super::pricing::ModelPricing;
use crate::error::LlmError;
use crate::metrics::{MetricsCollector, TokenUsage};

/// Text and accounting for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Dollars.
    pub cost: f64,
    pub duration: Duration,
}

impl GenerationOutput {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationOutput, LlmError>;
}

/// Adapts a [`ChatProvider`] into a [`GenerationService`].
pub struct ProviderGenerationService {
    provider: Arc<dyn ChatProvider>,
    pricing: ModelPricing,
    model: Option<String>,
    metrics: MetricsCollector,
}

impl ProviderGenerationService {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            provider,
            pricing: ModelPricing::default(),
            model: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Overrides the provider's default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }
}

#[async_trait]
impl GenerationService for ProviderGenerationService {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<GenerationOutput, LlmError> {
        let model = self.model().to_string();
        let request = ChatRequest::new(system_prompt, user_prompt)
            .with_model(model.clone())
            .with_temperature(temperature)
            .with_max_tokens(max_tokens);

        let start = Instant::now();
        let reply = self.provider.complete(&request).await?;
        let duration = start.elapsed();

        let text = reply.text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        let text = text.to_string();

        let input_tokens = reply.prompt_tokens;
        let output_tokens = reply.completion_tokens;
        let cost = self.pricing.cost(&model, input_tokens, output_tokens);
        self.metrics.record_llm_usage(
            &model,
            TokenUsage::new(input_tokens, output_tokens),
            cost * 100.0,
        );

        tracing::debug!(
            model = %model,
            input_tokens,
            output_tokens,
            cost,
            duration_ms = duration.as_millis() as u64,
            "Generation completed"
        );

        Ok(GenerationOutput {
            text,
            model,
            input_tokens,
            output_tokens,
            cost,
            duration,
        })
    }
}
