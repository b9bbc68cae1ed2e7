//! Process stage: drafts the answer and scores its confidence.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{decode_structured, prompts, StageContext, StageExecutor};
use crate::errors::PipelineError;
use crate::service::{SchemaDescriptor, ServiceRequest};
use crate::state::{AccumulatedState, Message, ProcessResult, StageName, StageOutput, StateUpdate};

/// Turns the Analysis result into a [`ProcessResult`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStage;

#[async_trait]
impl StageExecutor for ProcessStage {
    fn stage(&self) -> StageName {
        StageName::Process
    }

    async fn execute(
        &self,
        state: &AccumulatedState,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate, PipelineError> {
        let analysis = state.analysis().ok_or_else(|| {
            PipelineError::InvalidState("process requires an analysis result".to_string())
        })?;
        let question = state
            .messages()
            .latest_user()
            .map_or("", |message| message.content.as_str());

        let request = ServiceRequest {
            system_instruction: prompts::PROCESS_INSTRUCTION.to_string(),
            user_content: prompts::process_prompt(question, analysis),
            schema: Some(SchemaDescriptor::process()),
            generation: ctx.config.into(),
        };

        let started = Instant::now();
        let response = ctx
            .gateway
            .call(StageName::Process, ctx.cancel, || ctx.service.invoke(&request))
            .await?;
        ctx.usage.record(response.usage);
        let metrics = ctx.stage_metrics(StageName::Process, started.elapsed());

        let raw = response.content.raw_text();
        let result: ProcessResult = decode_structured(StageName::Process, &response.content)?;
        result
            .check_bounds()
            .map_err(|message| PipelineError::schema_mismatch(StageName::Process, message, Some(&raw)))?;
        debug!(confidence = result.confidence, "Process result decoded");

        Ok(StateUpdate::new()
            .with_output(StageOutput::Process(result))
            .with_message(Message::stage_response(StageName::Process, raw))
            .with_metrics(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::testing::{fixtures, ScriptedService, StageHarness};

    #[tokio::test]
    async fn test_process_builds_prompt_from_analysis() {
        let service = ScriptedService::new().with_structured(fixtures::process_json(0.82));
        let harness = StageHarness::new(service);
        let state = fixtures::analyzed_state("Explain photosynthesis");

        let update = harness.run(&ProcessStage, &state).await.unwrap();

        let Some(StageOutput::Process(result)) = update.output() else {
            panic!("expected process output");
        };
        assert!((result.confidence - 0.82).abs() < f64::EPSILON);
        let prompt = &harness.service.requests()[0].user_content;
        assert!(prompt.contains("Intent: explain photosynthesis"));
        assert!(prompt.contains("chlorophyll"));
    }

    #[tokio::test]
    async fn test_process_requires_analysis() {
        let harness = StageHarness::new(ScriptedService::new());
        let state = fixtures::initial_state("hello");

        let err = harness.run(&ProcessStage, &state).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(harness.service.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_schema_mismatch() {
        let service = ScriptedService::new().with_structured(fixtures::process_json(1.7));
        let harness = StageHarness::new(service);
        let state = fixtures::analyzed_state("hello");

        let err = harness.run(&ProcessStage, &state).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(err.diagnostic().contains("1.7"));
    }
}
