//! Analyze stage: intent and entity extraction.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{decode_structured, prompts, StageContext, StageExecutor};
use crate::errors::PipelineError;
use crate::service::{SchemaDescriptor, ServiceRequest};
use crate::state::{AccumulatedState, AnalysisResult, Message, StageName, StageOutput, StateUpdate};

/// Turns the latest user message into an [`AnalysisResult`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeStage;

#[async_trait]
impl StageExecutor for AnalyzeStage {
    fn stage(&self) -> StageName {
        StageName::Analyze
    }

    async fn execute(
        &self,
        state: &AccumulatedState,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate, PipelineError> {
        let question = state
            .messages()
            .latest_user()
            .ok_or_else(|| PipelineError::InvalidState("no user message to analyze".to_string()))?;

        let request = ServiceRequest {
            system_instruction: prompts::ANALYZE_INSTRUCTION.to_string(),
            user_content: question.content.clone(),
            schema: Some(SchemaDescriptor::analysis()),
            generation: ctx.config.into(),
        };

        let started = Instant::now();
        let response = ctx
            .gateway
            .call(StageName::Analyze, ctx.cancel, || ctx.service.invoke(&request))
            .await?;
        ctx.usage.record(response.usage);
        let metrics = ctx.stage_metrics(StageName::Analyze, started.elapsed());

        let analysis: AnalysisResult = decode_structured(StageName::Analyze, &response.content)?;
        debug!(
            intent = %analysis.intent,
            complexity = %analysis.complexity,
            entities = analysis.key_entities.len(),
            "Analysis decoded"
        );

        Ok(StateUpdate::new()
            .with_output(StageOutput::Analysis(analysis))
            .with_message(Message::stage_response(
                StageName::Analyze,
                response.content.raw_text(),
            ))
            .with_metrics(metrics))
    }
}
