//! Pipeline building and execution.
//!
//! This module provides:
//! - The state machine driving Analyze, Process and Synthesize
//! - The pipeline builder with validation
//! - The streamed run handle

mod builder;
mod machine;
mod run;

pub use builder::PipelineBuilder;
pub use machine::{PipelineStage, StageEvent, StageFailure};
pub use run::{PipelineRun, RunOutcome, RunRequest};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{ErrorKind, PipelineError};
use crate::gateway::{CircuitBreaker, ResilientGateway};
use crate::gates::{AnalysisGate, Gate, GateDecision, ProcessGate, SynthesisGate};
use crate::metrics::{duration_ms, MetricsSink, RunSummary};
use crate::relay::TokenRelay;
use crate::service::GenerativeService;
use crate::stages::{
    AnalyzeStage, ErrorStage, ProcessStage, StageContext, StageExecutor, SynthesizeStage,
    UsageMeter,
};
use crate::state::{AccumulatedState, StageName, StateUpdate, TextFormat};

struct PipelineInner {
    service: Arc<dyn GenerativeService>,
    config: PipelineConfig,
    gateway: ResilientGateway,
    sink: Arc<dyn MetricsSink>,
    process_gate: ProcessGate,
}

/// The Analyze → Process → Synthesize pipeline.
///
/// Cheap to clone; clones share the service, the gateway and its breaker.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub(crate) fn from_parts(
        service: Arc<dyn GenerativeService>,
        config: PipelineConfig,
        gateway: ResilientGateway,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let process_gate = ProcessGate::new(config.min_confidence);
        Self {
            inner: Arc::new(PipelineInner {
                service,
                config,
                gateway,
                sink,
                process_gate,
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Returns the shared circuit breaker.
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.gateway.breaker()
    }

    /// Starts a run on its own task and returns its event stream.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn run(&self, request: RunRequest) -> PipelineRun {
        let cancel = Arc::new(CancellationToken::new());
        let (relay, receiver) = TokenRelay::channel(self.inner.config.relay_buffer);

        let pipeline = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            match pipeline.execute(request, &token, Some(&relay)).await {
                Ok(outcome) => {
                    if !relay.complete(outcome).await {
                        debug!("Run completed after its consumer went away");
                    }
                }
                Err(e) => debug!(reason = %e, "Run ended without a terminal event"),
            }
        });

        PipelineRun::new(ReceiverStream::new(receiver), cancel, task)
    }

    /// Executes a run to completion.
    ///
    /// Fragments of the final stage go to `relay` when one is given.
    ///
    /// # Errors
    ///
    /// Only [`PipelineError::Cancelled`]: every other failure is turned into
    /// a successful [`RunOutcome`] with `succeeded == false`.
    pub async fn execute(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
        relay: Option<&TokenRelay>,
    ) -> Result<RunOutcome, PipelineError> {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let span = info_span!(
            "pipeline_run",
            correlation_id = %correlation_id,
            actor_id = %request.actor_id,
        );

        let state = AccumulatedState::new(request.messages, correlation_id, request.actor_id);
        self.drive(state, cancel, relay).instrument(span).await
    }

    async fn drive(
        &self,
        mut state: AccumulatedState,
        cancel: &CancellationToken,
        relay: Option<&TokenRelay>,
    ) -> Result<RunOutcome, PipelineError> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut position = PipelineStage::Start;
        let mut succeeded = true;
        info!("Pipeline run started");

        while !position.is_terminal() {
            if cancel.is_cancelled() {
                info!(stage = %position, "Pipeline run cancelled");
                return Err(cancel.to_error());
            }

            let event = match &position {
                PipelineStage::Error(failure) => {
                    succeeded = false;
                    self.run_error_stage(&mut state, failure.origin, &failure.error);
                    StageEvent::Completed
                }
                current => match current.stage_name() {
                    None => StageEvent::Completed,
                    Some(stage) => match self.run_stage(stage, &mut state, cancel, relay).await {
                        Ok(()) => StageEvent::Completed,
                        Err(e) if e.is_cancelled() => {
                            info!(stage = %stage, "Pipeline run cancelled");
                            return Err(e);
                        }
                        Err(e) => {
                            log_failure(stage, &e);
                            StageEvent::Failed(StageFailure {
                                origin: stage,
                                error: e,
                            })
                        }
                    },
                },
            };
            position = position.transition(event);
        }

        let summary = RunSummary::new(
            state.correlation_id(),
            state.actor_id(),
            started_at,
            started.elapsed(),
            succeeded,
            state.metrics().clone(),
        );
        self.inner.sink.record_run_summary(&summary);

        let final_text = state
            .final_text()
            .filter(|text| !text.trim().is_empty())
            .map_or_else(
                || {
                    ErrorStage
                        .user_message(StageName::Error, ErrorKind::InvalidState)
                        .to_string()
                },
                str::to_string,
            );
        let format = state
            .synthesis()
            .filter(|_| succeeded)
            .map_or_else(|| TextFormat::classify(&final_text), |s| s.format);

        info!(
            succeeded = succeeded,
            total_elapsed_ms = summary.total_elapsed_ms,
            total_cost_usd = summary.total_cost_usd,
            "Pipeline run finished"
        );
        Ok(RunOutcome {
            final_text,
            format,
            succeeded,
            summary,
        })
    }

    /// Runs one service-backed stage under its timeout, gates its output and
    /// merges the result.
    async fn run_stage(
        &self,
        stage: StageName,
        state: &mut AccumulatedState,
        cancel: &CancellationToken,
        relay: Option<&TokenRelay>,
    ) -> Result<(), PipelineError> {
        let inner = &*self.inner;
        let executor: &dyn StageExecutor = match stage {
            StageName::Analyze => &AnalyzeStage,
            StageName::Process => &ProcessStage,
            StageName::Synthesize => &SynthesizeStage,
            StageName::Error => {
                return Err(PipelineError::InvalidState(
                    "the error stage is not service-backed".to_string(),
                ))
            }
        };
        let gate: &dyn Gate = match stage {
            StageName::Analyze => &AnalysisGate,
            StageName::Process => &inner.process_gate,
            StageName::Synthesize | StageName::Error => &SynthesisGate,
        };
        let config = inner.config.stage_config(stage).ok_or_else(|| {
            PipelineError::InvalidState(format!("no configuration for stage '{stage}'"))
        })?;

        let usage = UsageMeter::new();
        let ctx = StageContext {
            gateway: &inner.gateway,
            service: inner.service.as_ref(),
            config,
            cancel,
            cost_model: &inner.config.pricing,
            relay: if executor.streams() { relay } else { None },
            usage: &usage,
        };

        let timeout = config.timeout();
        debug!(stage = %stage, timeout_ms = duration_ms(timeout), "Stage started");
        let started = Instant::now();
        let result = match cancel
            .run_until_cancelled(tokio::time::timeout(timeout, executor.execute(state, &ctx)))
            .await?
        {
            Ok(result) => result,
            Err(_elapsed) => Err(PipelineError::TimeoutExceeded { stage, timeout }),
        };
        let update = match result {
            Ok(update) => update,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                // The stage ran, so it keeps its entry even without an output.
                let metrics = ctx.stage_metrics(stage, started.elapsed());
                inner.sink.record_stage(&metrics);
                state.merge_rejected(StateUpdate::new().with_metrics(metrics))?;
                return Err(e);
            }
        };

        if let Some(metrics) = update.metrics() {
            inner.sink.record_stage(metrics);
        }

        let decision = match update.output() {
            Some(output) => gate.evaluate(output),
            None => GateDecision::reject(format!("stage '{stage}' produced no output")),
        };
        match decision.into_result(stage) {
            Ok(()) => state.merge(update),
            Err(rejection) => {
                state.merge_rejected(update)?;
                Err(rejection)
            }
        }
    }

    fn run_error_stage(&self, state: &mut AccumulatedState, origin: StageName, failure: &PipelineError) {
        // Synchronous and constant; recorded as zero elapsed.
        let update = ErrorStage.respond(origin, failure, Duration::ZERO);
        debug!(origin = %origin, error_kind = %failure.kind(), "Error stage produced fallback response");
        if let Some(metrics) = update.metrics() {
            self.inner.sink.record_stage(metrics);
        }
        if let Err(e) = state.merge(update) {
            error!(error = %e, origin = %origin, "Failed to record the error stage");
        }
    }
}

fn log_failure(stage: StageName, error: &PipelineError) {
    let kind = error.kind();
    let raw = error.raw_response();
    match kind {
        ErrorKind::GateRejection => {
            info!(stage = %stage, error_kind = %kind, reason = %error.diagnostic(), "Stage output rejected by gate");
        }
        ErrorKind::InvalidState | ErrorKind::Config => {
            error!(stage = %stage, error_kind = %kind, error = %error, "Stage failed");
        }
        _ => {
            warn!(
                stage = %stage,
                error_kind = %kind,
                error = %error,
                raw_response = raw.as_deref().unwrap_or(""),
                "Stage failed"
            );
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.inner.config)
            .field("gateway", &self.inner.gateway)
            .finish_non_exhaustive()
    }
}
