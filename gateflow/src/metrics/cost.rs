//! Per-model token pricing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// USD price per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per million input tokens.
    pub input_per_million: f64,
    /// Price per million output tokens.
    pub output_per_million: f64,
}

impl Pricing {
    /// Creates a price entry.
    #[must_use]
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self::new(0.10, 0.40)
    }
}

/// Price table keyed by model name, with a fallback price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Price used for models missing from `models`.
    #[serde(default)]
    pub default: Pricing,
    /// Known model prices.
    #[serde(default)]
    pub models: HashMap<String, Pricing>,
}

impl Default for CostModel {
    fn default() -> Self {
        let models = [
            ("gemini-2.0-flash", Pricing::new(0.10, 0.40)),
            ("gemini-2.0-flash-lite", Pricing::new(0.075, 0.30)),
            ("gemini-1.5-pro", Pricing::new(1.25, 5.00)),
        ]
        .into_iter()
        .map(|(name, price)| (name.to_string(), price))
        .collect();

        Self {
            default: Pricing::default(),
            models,
        }
    }
}

impl CostModel {
    /// Adds or replaces a model's price.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, pricing: Pricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    /// Returns the price of a model, falling back to the default.
    #[must_use]
    pub fn pricing(&self, model: Option<&str>) -> Pricing {
        model
            .and_then(|m| self.models.get(m))
            .copied()
            .unwrap_or(self.default)
    }

    /// Computes the USD cost of a call.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, model: Option<&str>, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.pricing(model);
        (input_tokens as f64 * price.input_per_million
            + output_tokens as f64 * price.output_per_million)
            / TOKENS_PER_MILLION
    }
}
