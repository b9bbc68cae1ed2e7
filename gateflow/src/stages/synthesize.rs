//! Synthesize stage: streams the final user-facing text.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;

use super::{prompts, StageContext, StageExecutor};
use crate::errors::PipelineError;
use crate::service::{ServiceRequest, StreamChunk};
use crate::state::{AccumulatedState, Message, StageName, StageOutput, StateUpdate, SynthesisResult};

/// Streams the final answer from the Process result.
///
/// Fragments are forwarded through the relay in arrival order as they are
/// received. Metrics are finalized only once the stream closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesizeStage;

#[async_trait]
impl StageExecutor for SynthesizeStage {
    fn stage(&self) -> StageName {
        StageName::Synthesize
    }

    fn streams(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AccumulatedState,
        ctx: &StageContext<'_>,
    ) -> Result<StateUpdate, PipelineError> {
        let process = state.process().ok_or_else(|| {
            PipelineError::InvalidState("synthesize requires a process result".to_string())
        })?;
        let question = state
            .messages()
            .latest_user()
            .map_or("", |message| message.content.as_str());

        let request = ServiceRequest {
            system_instruction: prompts::SYNTHESIZE_INSTRUCTION.to_string(),
            user_content: prompts::synthesize_prompt(question, process),
            schema: None,
            generation: ctx.config.into(),
        };

        let started = Instant::now();
        let mut stream = ctx
            .gateway
            .call(StageName::Synthesize, ctx.cancel, || {
                ctx.service.invoke_streaming(&request)
            })
            .await?;

        let mut text = String::new();
        let mut fragments = 0usize;

        while let Some(chunk) = ctx.cancel.run_until_cancelled(stream.next()).await? {
            match chunk {
                Ok(StreamChunk::Fragment(fragment)) => {
                    fragments += 1;
                    text.push_str(&fragment);
                    if let Some(relay) = ctx.relay {
                        relay.forward(fragment, ctx.cancel).await?;
                    }
                }
                Ok(StreamChunk::Usage(reported)) => ctx.usage.record(reported),
                Err(error) => {
                    ctx.gateway.observe_stream_failure(StageName::Synthesize, &error);
                    return Err(PipelineError::from_service(error, 1));
                }
            }
        }
        debug!(fragments = fragments, chars = text.len(), "Synthesis stream closed");

        let metrics = ctx.stage_metrics(StageName::Synthesize, started.elapsed());

        Ok(StateUpdate::new()
            .with_message(Message::stage_response(StageName::Synthesize, text.clone()))
            .with_output(StageOutput::Synthesis(SynthesisResult::new(text)))
            .with_metrics(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ServiceError};
    use crate::gateway::CircuitState;
    use crate::relay::TokenRelay;
    use crate::service::Usage;
    use crate::state::TextFormat;
    use crate::testing::{fixtures, ScriptedService, ScriptedStream, StageHarness};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_fragments_are_relayed_in_order() {
        let service = ScriptedService::new().with_stream(
            ScriptedStream::new(["Plants ", "make ", "sugar."]).with_usage(Usage::new(40, 6)),
        );
        let harness = StageHarness::new(service);
        let state = fixtures::processed_state("Explain photosynthesis", 0.9);
        let (relay, mut rx) = TokenRelay::channel(16);

        let update = harness
            .run_with_relay(&SynthesizeStage, &state, &relay)
            .await
            .unwrap();
        drop(relay);

        let mut tokens = Vec::new();
        while let Some(event) = rx.recv().await {
            tokens.push(event.as_token().unwrap().to_string());
        }
        assert_eq!(tokens, vec!["Plants ", "make ", "sugar."]);

        let Some(StageOutput::Synthesis(result)) = update.output() else {
            panic!("expected synthesis output");
        };
        assert_eq!(result.text, tokens.concat());
        assert_eq!(result.format, TextFormat::PlainText);
        assert_eq!(update.metrics().unwrap().output_tokens, 6);
    }

    #[tokio::test]
    async fn test_missing_usage_reports_zero_tokens() {
        let service = ScriptedService::new().with_stream(ScriptedStream::new(["# Title\n", "- item"]));
        let harness = StageHarness::new(service);
        let state = fixtures::processed_state("q", 0.9);

        let update = harness.run(&SynthesizeStage, &state).await.unwrap();
        let metrics = update.metrics().unwrap();
        assert_eq!(metrics.input_tokens, 0);
        assert_eq!(metrics.output_tokens, 0);
        assert_eq!(metrics.cost_usd, 0.0);
        let Some(StageOutput::Synthesis(result)) = update.output() else {
            panic!("expected synthesis output");
        };
        assert_eq!(result.format, TextFormat::Markdown);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_counts_toward_breaker_without_reopening() {
        let service = ScriptedService::new().with_stream(
            ScriptedStream::new(["a", "b", "c"]).failing_after(2, ServiceError::connection("reset")),
        );
        let harness = StageHarness::new(service).with_failure_threshold(1);
        let state = fixtures::processed_state("q", 0.9);

        let err = harness.run(&SynthesizeStage, &state).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryableServiceError);
        assert_eq!(harness.service.stream_calls(), 1);
        assert_eq!(harness.gateway.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_synthesize_requires_process_result() {
        let harness = StageHarness::new(ScriptedService::new());
        let state = fixtures::analyzed_state("q");

        let err = harness.run(&SynthesizeStage, &state).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_streams_flag() {
        assert!(SynthesizeStage.streams());
        assert_eq!(SynthesizeStage.stage(), StageName::Synthesize);
    }
}
