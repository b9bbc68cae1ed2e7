//! Harness for running a single stage executor in isolation.

use std::sync::Arc;

use super::mocks::ScriptedService;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::gateway::{CircuitBreaker, CircuitBreakerConfig, JitterStrategy, ResilientGateway, RetryConfig};
use crate::metrics::CollectingMetricsSink;
use crate::relay::TokenRelay;
use crate::stages::{StageContext, StageExecutor, UsageMeter};
use crate::state::{AccumulatedState, StateUpdate};

/// Runs executors against a [`ScriptedService`] through a real gateway.
///
/// Retries back off for one millisecond without jitter, so retry tests stay
/// fast without pausing the clock.
pub struct StageHarness {
    /// The scripted service.
    pub service: ScriptedService,
    /// The gateway every call goes through.
    pub gateway: ResilientGateway,
    /// Sink collecting attempt records.
    pub sink: Arc<CollectingMetricsSink>,
    /// Configuration the stage settings are taken from.
    pub config: PipelineConfig,
    /// Token passed to every run.
    pub cancel: CancellationToken,
    /// Usage reported during the last run, kept when the stage fails.
    pub usage: UsageMeter,
}

impl StageHarness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new(service: ScriptedService) -> Self {
        let config = PipelineConfig::default().with_retry(
            RetryConfig::new()
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
        );
        let sink = Arc::new(CollectingMetricsSink::new());
        let gateway = Self::gateway(&config, config.circuit_breaker.clone(), &sink);
        Self {
            service,
            gateway,
            sink,
            config,
            cancel: CancellationToken::new(),
            usage: UsageMeter::new(),
        }
    }

    /// Replaces the breaker with a fresh one tripping after `threshold`
    /// failures.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        let breaker = self
            .config
            .circuit_breaker
            .clone()
            .with_failure_threshold(threshold);
        self.gateway = Self::gateway(&self.config, breaker, &self.sink);
        self
    }

    fn gateway(
        config: &PipelineConfig,
        breaker: CircuitBreakerConfig,
        sink: &Arc<CollectingMetricsSink>,
    ) -> ResilientGateway {
        ResilientGateway::new(
            Arc::new(CircuitBreaker::new(breaker)),
            config.retry.clone(),
            sink.clone(),
        )
    }

    /// Runs `executor` without a relay.
    pub async fn run(
        &self,
        executor: &dyn StageExecutor,
        state: &AccumulatedState,
    ) -> Result<StateUpdate, PipelineError> {
        self.execute(executor, state, None).await
    }

    /// Runs `executor` forwarding fragments to `relay`.
    pub async fn run_with_relay(
        &self,
        executor: &dyn StageExecutor,
        state: &AccumulatedState,
        relay: &TokenRelay,
    ) -> Result<StateUpdate, PipelineError> {
        self.execute(executor, state, Some(relay)).await
    }

    async fn execute(
        &self,
        executor: &dyn StageExecutor,
        state: &AccumulatedState,
        relay: Option<&TokenRelay>,
    ) -> Result<StateUpdate, PipelineError> {
        let stage = executor.stage();
        let config = self.config.stage_config(stage).ok_or_else(|| {
            PipelineError::InvalidState(format!("no configuration for stage '{stage}'"))
        })?;
        let ctx = StageContext {
            gateway: &self.gateway,
            service: &self.service,
            config,
            cancel: &self.cancel,
            cost_model: &self.config.pricing,
            relay,
            usage: &self.usage,
        };
        executor.execute(state, &ctx).await
    }
}

impl std::fmt::Debug for StageHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHarness")
            .field("service", &self.service)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}
