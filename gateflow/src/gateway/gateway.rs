//! The resilient call gateway.

use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::retry::{RetryConfig, RetryState};
use crate::cancellation::CancellationToken;
use crate::errors::{PipelineError, ServiceError};
use crate::metrics::{duration_ms, AttemptOutcome, AttemptRecord, MetricsSink};
use crate::state::StageName;

/// Wraps every call to the generative service with the shared circuit
/// breaker, bounded retries and cancellation.
#[derive(Clone)]
pub struct ResilientGateway {
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    sink: Arc<dyn MetricsSink>,
}

impl ResilientGateway {
    /// Creates a gateway around a shared breaker.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            breaker,
            retry,
            sink,
        }
    }

    /// Returns the shared breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Runs `op` until it succeeds, fails non-retryably, exhausts its
    /// attempts, meets an open breaker, or is cancelled.
    ///
    /// `op` is invoked once per attempt. Only the final outcome is returned;
    /// each attempt is reported to the metrics sink.
    pub async fn call<T, F, Fut>(
        &self,
        stage: StageName,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut state = RetryState::new();

        loop {
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    debug!(stage = %stage, attempt = state.attempts() + 1, "Circuit open; call not attempted");
                    self.sink.record_attempt(&AttemptRecord {
                        stage,
                        attempt: state.attempts() + 1,
                        elapsed_ms: 0,
                        outcome: AttemptOutcome::CircuitOpen,
                    });
                    return Err(err);
                }
            };

            let attempt = state.begin_attempt();
            let started = Instant::now();
            let result = cancel.run_until_cancelled(op()).await?;
            let elapsed_ms = duration_ms(started.elapsed());

            let error = match result {
                Ok(value) => {
                    permit.success();
                    self.record(stage, attempt, elapsed_ms, AttemptOutcome::Success);
                    return Ok(value);
                }
                Err(error) => error,
            };
            self.record(stage, attempt, elapsed_ms, AttemptOutcome::Failed(error.kind));

            if !error.is_retryable() {
                drop(permit);
                warn!(
                    stage = %stage,
                    attempt = attempt,
                    error_kind = %error.kind,
                    status = error.status,
                    "Non-retryable service failure"
                );
                return Err(PipelineError::NonRetryableService(error));
            }

            permit.failure();
            if state.is_exhausted(&self.retry) {
                warn!(
                    stage = %stage,
                    attempts = attempt,
                    error_kind = %error.kind,
                    "Retries exhausted"
                );
                return Err(PipelineError::from_service(error, attempt));
            }

            let delay = state.calculate_delay(&self.retry);
            warn!(
                stage = %stage,
                attempt = attempt,
                delay_ms = duration_ms(delay),
                error_kind = %error.kind,
                "Retryable service failure; backing off"
            );
            cancel.run_until_cancelled(tokio::time::sleep(delay)).await?;
        }
    }

    /// Reports a failure that arrived after a stream was opened.
    ///
    /// The stream is not re-opened, but a retryable failure still counts
    /// toward the breaker.
    pub fn observe_stream_failure(&self, stage: StageName, error: &ServiceError) {
        if error.is_retryable() {
            warn!(stage = %stage, error_kind = %error.kind, "Stream failed after it was opened");
            self.breaker.record_failure();
        }
    }

    fn record(&self, stage: StageName, attempt: u32, elapsed_ms: u64, outcome: AttemptOutcome) {
        self.sink.record_attempt(&AttemptRecord {
            stage,
            attempt,
            elapsed_ms,
            outcome,
        });
    }
}

impl std::fmt::Debug for ResilientGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientGateway")
            .field("breaker", &self.breaker.stats())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ServiceErrorKind};
    use crate::gateway::{CircuitBreakerConfig, CircuitState, JitterStrategy};
    use crate::metrics::CollectingMetricsSink;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        gateway: ResilientGateway,
        sink: Arc<CollectingMetricsSink>,
        calls: Arc<AtomicU32>,
    }

    fn harness(max_attempts: u32, threshold: u32) -> Harness {
        let sink = Arc::new(CollectingMetricsSink::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(30)),
        ));
        let retry = RetryConfig::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        Harness {
            gateway: ResilientGateway::new(breaker, retry, sink.clone()),
            sink,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// An operation failing with `error` for the first `failures` calls.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
        error: ServiceError,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<&'static str, ServiceError>> + Send>>
    {
        let calls = calls.clone();
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let error = error.clone();
            Box::pin(async move {
                if n <= failures {
                    Err(error)
                } else {
                    Ok("ok")
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let h = harness(3, 10);
        let cancel = CancellationToken::new();
        let op = flaky(&h.calls, 2, ServiceError::server(503, "unavailable"));

        let value = h.gateway.call(StageName::Analyze, &cancel, op).await.unwrap();

        assert_eq!(value, "ok");
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        let outcomes: Vec<_> = h.sink.attempts().iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Failed(ServiceErrorKind::Server),
                AttemptOutcome::Failed(ServiceErrorKind::Server),
                AttemptOutcome::Success,
            ]
        );
        assert_eq!(h.gateway.breaker().stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let h = harness(3, 10);
        let cancel = CancellationToken::new();
        let op = flaky(&h.calls, 10, ServiceError::timeout("slow"));

        let err = h.gateway.call(StageName::Process, &cancel, op).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetryableServiceError);
        assert!(matches!(err, PipelineError::RetryableService { attempts: 3, .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.gateway.breaker().stats().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_is_not_retried_or_counted() {
        let h = harness(3, 1);
        let cancel = CancellationToken::new();
        let op = flaky(&h.calls, 10, ServiceError::authentication("bad key"));

        let err = h.gateway.call(StageName::Analyze, &cancel, op).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NonRetryableServiceError);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.gateway.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_fails_fast() {
        let h = harness(5, 2);
        let cancel = CancellationToken::new();
        let op = flaky(&h.calls, 10, ServiceError::connection("reset"));

        let err = h.gateway.call(StageName::Analyze, &cancel, op).await.unwrap_err();

        assert!(matches!(err, PipelineError::CircuitOpen { .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.sink.attempts().last().unwrap().outcome, AttemptOutcome::CircuitOpen);

        let op = flaky(&h.calls, 0, ServiceError::connection("unused"));
        let err = h.gateway.call(StageName::Analyze, &cancel, op).await.unwrap_err();
        assert!(matches!(err, PipelineError::CircuitOpen { .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let h = harness(3, 10);
        let cancel = Arc::new(CancellationToken::new());
        let op = flaky(&h.calls, 10, ServiceError::server(500, "boom"));

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel("caller left");
            })
        };

        let err = h.gateway.call(StageName::Analyze, &cancel, op).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_failure_counts_only_when_retryable() {
        let h = harness(3, 1);
        h.gateway
            .observe_stream_failure(StageName::Synthesize, &ServiceError::validation("blocked"));
        assert_eq!(h.gateway.breaker().state(), CircuitState::Closed);

        h.gateway
            .observe_stream_failure(StageName::Synthesize, &ServiceError::connection("reset"));
        assert_eq!(h.gateway.breaker().state(), CircuitState::Open);
    }
}
