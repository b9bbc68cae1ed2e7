//! Stage executors.
//!
//! Each executor makes its service call through the gateway and returns a
//! [`StateUpdate`]; it never mutates the accumulated state and never retries
//! on its own. Gates are applied by the state machine, not here.

mod analyze;
mod error_stage;
mod process;
mod prompts;
mod synthesize;

pub use analyze::AnalyzeStage;
pub use error_stage::ErrorStage;
pub use process::ProcessStage;
pub use synthesize::SynthesizeStage;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::StageConfig;
use crate::errors::PipelineError;
use crate::gateway::ResilientGateway;
use crate::metrics::{CostModel, StageMetrics};
use crate::relay::TokenRelay;
use crate::service::{GenerativeService, ResponseContent, Usage};
use crate::state::{AccumulatedState, StageName, StateUpdate};

/// Everything an executor needs for one run of its stage.
pub struct StageContext<'a> {
    /// Gateway wrapping every service call.
    pub gateway: &'a ResilientGateway,
    /// The generative service.
    pub service: &'a dyn GenerativeService,
    /// This stage's settings.
    pub config: &'a StageConfig,
    /// The run's cancellation token.
    pub cancel: &'a CancellationToken,
    /// Price table for stage metrics.
    pub cost_model: &'a CostModel,
    /// Token relay, present for streamed runs.
    pub relay: Option<&'a TokenRelay>,
    /// Usage reported by the service so far.
    pub usage: &'a UsageMeter,
}

impl StageContext<'_> {
    /// Builds the stage's metrics entry from the usage reported so far.
    #[must_use]
    pub fn stage_metrics(&self, stage: StageName, elapsed: Duration) -> StageMetrics {
        let usage = self.usage.get();
        StageMetrics::new(stage)
            .with_elapsed(elapsed)
            .with_usage(usage.input_tokens, usage.output_tokens)
            .with_model(&self.config.model)
            .priced(self.cost_model)
    }
}

/// Holds the latest usage report of one stage.
///
/// Outlives the executor's future, so a stage that fails or times out after
/// the service answered is still charged for it.
#[derive(Debug, Default)]
pub struct UsageMeter {
    reported: Mutex<Usage>,
}

impl UsageMeter {
    /// Creates a meter with zero usage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the recorded usage.
    pub fn record(&self, usage: Usage) {
        *self.reported.lock() = usage;
    }

    /// Returns the recorded usage.
    #[must_use]
    pub fn get(&self) -> Usage {
        *self.reported.lock()
    }
}

/// One service-backed stage of the pipeline.
#[async_trait]
pub trait StageExecutor: Send + Sync + Debug {
    /// The stage this executor implements.
    fn stage(&self) -> StageName;

    /// Whether the stage streams free text instead of returning a
    /// structured result.
    fn streams(&self) -> bool {
        false
    }

    /// Runs the stage against the current state.
    async fn execute(
        &self,
        state: &AccumulatedState,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate, PipelineError>;
}

/// Decodes a structured result, accepting JSON returned as text.
pub(crate) fn decode_structured<T>(
    stage: StageName,
    content: &ResponseContent,
) -> Result<T, PipelineError>
where
    T: DeserializeOwned,
{
    let value = match content {
        ResponseContent::Structured(value) => value.clone(),
        ResponseContent::Text(text) => serde_json::from_str(strip_code_fence(text)).map_err(|e| {
            PipelineError::schema_mismatch(stage, format!("response is not valid JSON: {e}"), Some(text))
        })?,
    };

    serde_json::from_value(value.clone()).map_err(|e| {
        PipelineError::schema_mismatch(
            stage,
            format!("result does not match the {stage} schema: {e}"),
            Some(&value.to_string()),
        )
    })
}

/// Removes a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
