//! Per-model token pricing.

use std::collections::HashMap;

/// Dollars per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPrice {
    pub const fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    /// Cost in dollars.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// Pricing table with a fallback for unknown models.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for ModelPricing {
    fn default() -> Self {
        let mut pricing = Self::new(ModelPrice::new(3.0, 15.0));
        pricing.insert("anthropic/claude-sonnet-4", ModelPrice::new(3.0, 15.0));
        pricing.insert("anthropic/claude-opus-4.5", ModelPrice::new(5.0, 25.0));
        pricing.insert("openai/gpt-4o", ModelPrice::new(2.5, 10.0));
        pricing.insert("openai/gpt-4o-mini", ModelPrice::new(0.15, 0.6));
        pricing
    }
}

impl ModelPricing {
    pub fn new(fallback: ModelPrice) -> Self {
        Self {
            prices: HashMap::new(),
            fallback,
        }
    }

    /// Pricing that charges nothing; used with scripted generators.
    pub fn free() -> Self {
        Self::new(ModelPrice::new(0.0, 0.0))
    }

    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    /// Price for a model, matching either the full id or the part after
    /// the provider prefix.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.prices.get(model) {
            return *price;
        }
        let short = model.rsplit('/').next().unwrap_or(model);
        self.prices
            .iter()
            .find(|(name, _)| name.rsplit('/').next() == Some(short))
            .map(|(_, price)| *price)
            .unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.price_for(model).cost(input_tokens, output_tokens)
    }
}
