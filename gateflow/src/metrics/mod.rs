//! Per-stage and per-run metrics.
//!
//! Every executed stage contributes exactly one [`StageMetrics`] entry, the
//! gateway reports one [`AttemptRecord`] per network attempt, and a finished
//! run produces a [`RunSummary`]. All three are handed to a [`MetricsSink`].

mod cost;
mod sink;

pub use cost::{CostModel, Pricing};
pub use sink::{CollectingMetricsSink, MetricsSink, NoOpMetricsSink, TracingMetricsSink};

#[cfg(test)]
pub use sink::MockMetricsSink;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::{ErrorKind, PipelineError, ServiceErrorKind};
use crate::state::StageName;

/// Why the error stage ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stage whose failure or rejection routed to the error stage.
    pub origin: StageName,
    /// Stable error label.
    pub kind: ErrorKind,
    /// Short diagnostic reason, free of raw service bodies.
    pub reason: String,
}

/// Latency, token and cost figures for one executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// The stage these figures belong to.
    pub stage: StageName,
    /// Wall-clock time spent in the stage, retries included.
    pub elapsed_ms: u64,
    /// Prompt tokens reported by the service.
    pub input_tokens: u64,
    /// Completion tokens reported by the service.
    pub output_tokens: u64,
    /// Cost of the stage in USD.
    pub cost_usd: f64,
    /// Model that served the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Set only on the error stage's entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl StageMetrics {
    /// Creates an empty entry for a stage.
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            elapsed_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            model: None,
            error: None,
        }
    }

    /// Sets the elapsed time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = duration_ms(elapsed);
        self
    }

    /// Sets token usage.
    #[must_use]
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Sets the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Prices the recorded usage with `cost_model`.
    #[must_use]
    pub fn priced(mut self, cost_model: &CostModel) -> Self {
        self.cost_usd = cost_model.cost(
            self.model.as_deref(),
            self.input_tokens,
            self.output_tokens,
        );
        self
    }

    /// Attaches the error record.
    #[must_use]
    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.error = Some(error);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Ordered, insert-once map from stage to its metrics entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsMap {
    entries: Vec<StageMetrics>,
}

impl MetricsMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry; a second entry for the same stage is refused.
    pub fn insert(&mut self, metrics: StageMetrics) -> Result<(), PipelineError> {
        if self.contains(metrics.stage) {
            return Err(PipelineError::InvalidState(format!(
                "metrics for stage '{}' were already recorded",
                metrics.stage
            )));
        }
        self.entries.push(metrics);
        Ok(())
    }

    /// Returns the entry of a stage.
    #[must_use]
    pub fn get(&self, stage: StageName) -> Option<&StageMetrics> {
        self.entries.iter().find(|m| m.stage == stage)
    }

    /// Returns true if the stage has an entry.
    #[must_use]
    pub fn contains(&self, stage: StageName) -> bool {
        self.get(stage).is_some()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageMetrics> {
        self.entries.iter()
    }

    /// Returns the executed stages in order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageName> {
        self.entries.iter().map(|m| m.stage).collect()
    }

    /// Sums cost over all stages.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.entries.iter().map(|m| m.cost_usd).sum()
    }

    /// Sums input tokens over all stages.
    #[must_use]
    pub fn total_input_tokens(&self) -> u64 {
        self.entries.iter().map(|m| m.input_tokens).sum()
    }

    /// Sums output tokens over all stages.
    #[must_use]
    pub fn total_output_tokens(&self) -> u64 {
        self.entries.iter().map(|m| m.output_tokens).sum()
    }
}

/// Result of one gateway attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error_kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The call succeeded.
    Success,
    /// The call failed with the given classification.
    Failed(ServiceErrorKind),
    /// The breaker refused the attempt.
    CircuitOpen,
}

impl AttemptOutcome {
    /// Returns a short label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed(kind) => kind.as_str(),
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// One network attempt made by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Stage the attempt served.
    pub stage: StageName,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time spent in the attempt.
    pub elapsed_ms: u64,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

/// Aggregate report emitted when a run reaches `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Request correlation identifier.
    pub correlation_id: String,
    /// Requesting actor.
    pub actor_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run.
    pub total_elapsed_ms: u64,
    /// Sum of stage costs.
    pub total_cost_usd: f64,
    /// Sum of input tokens.
    pub total_input_tokens: u64,
    /// Sum of output tokens.
    pub total_output_tokens: u64,
    /// False when the run ended in the error stage.
    pub succeeded: bool,
    /// Per-stage breakdown in execution order.
    pub stages: MetricsMap,
}

impl RunSummary {
    /// Builds a summary from a finished run's metrics.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        actor_id: impl Into<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        succeeded: bool,
        stages: MetricsMap,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            actor_id: actor_id.into(),
            started_at,
            total_elapsed_ms: duration_ms(elapsed),
            total_cost_usd: stages.total_cost_usd(),
            total_input_tokens: stages.total_input_tokens(),
            total_output_tokens: stages.total_output_tokens(),
            succeeded,
            stages,
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
