//! Circuit breaker guarding the generative service.
//!
//! One breaker is shared by every call a gateway makes, across concurrent
//! runs. It trips after a run of consecutive retryable failures and then
//! blocks calls until the recovery timeout has elapsed, after which exactly
//! one trial call is admitted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::metrics::duration_ms;

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive retryable failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial call.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    30.0
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Gets the recovery timeout as a Duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Checks the thresholds are usable.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.recovery_timeout_seconds < 0.0
            || Duration::try_from_secs_f64(self.recovery_timeout_seconds).is_err()
        {
            return Err(PipelineError::Config(format!(
                "circuit_breaker.recovery_timeout_seconds must be a non-negative duration in range, got {}",
                self.recovery_timeout_seconds
            )));
        }
        Ok(())
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the recovery timeout elapses.
    Open,
    /// One trial call decides whether to close or re-open.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,
    trial_in_flight: bool,
    // Bumped on every mode change; permits from an older generation are stale.
    generation: u64,
}

/// Process-wide circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                last_transition: Utc::now(),
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current mode.
    ///
    /// An open breaker whose recovery timeout has elapsed reports `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.remaining_open(&inner).is_zero() => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Asks permission to make a call.
    ///
    /// The returned permit must be settled with the call's outcome. Dropping
    /// it unsettled counts as no verdict.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, PipelineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false, inner.generation)),
            CircuitState::Open => {
                let retry_after = self.remaining_open(&inner);
                if !retry_after.is_zero() {
                    return Err(PipelineError::CircuitOpen { retry_after });
                }
                info!("Circuit breaker transitioning to half-open after recovery timeout");
                Self::transition_to(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(BreakerPermit::new(self, true, inner.generation))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(PipelineError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                Ok(BreakerPermit::new(self, true, inner.generation))
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        Self::apply_success(&mut inner);
    }

    /// Records a retryable failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.apply_failure(&mut inner);
    }

    fn apply_success(inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                info!("Circuit breaker closing after successful trial call");
                Self::transition_to(inner, CircuitState::Closed);
            }
            CircuitState::Open => debug!("Success recorded while circuit open"),
        }
    }

    fn apply_failure(&self, inner: &mut BreakerInner) {
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        recovery_timeout_ms = duration_ms(self.config.recovery_timeout()),
                        "Circuit breaker opening due to consecutive failures"
                    );
                    Self::transition_to(inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                warn!("Circuit breaker re-opening after failed trial call");
                Self::transition_to(inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Applies a permit's verdict unless the permit predates the current mode.
    ///
    /// In Half-Open only the trial permit may decide the next mode.
    fn settle(&self, generation: u64, trial: bool, success: bool) {
        let mut inner = self.inner.lock();
        let current = inner.generation == generation
            && (trial || inner.state != CircuitState::HalfOpen);
        if !current {
            debug!(
                state = %inner.state,
                success = success,
                "Ignoring outcome of a call admitted before the last transition"
            );
            if !success {
                inner.last_failure_at = Some(Utc::now());
            }
            return;
        }
        if success {
            Self::apply_success(&mut inner);
        } else {
            self.apply_failure(&mut inner);
        }
    }

    /// Returns a diagnostics snapshot.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: inner.last_failure_at,
            last_transition: inner.last_transition,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.trial_in_flight = false;
        }
    }

    fn remaining_open(&self, inner: &BreakerInner) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened| {
            self.config
                .recovery_timeout()
                .saturating_sub(opened.elapsed())
        })
    }

    fn transition_to(inner: &mut BreakerInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();
        inner.trial_in_flight = false;
        inner.generation += 1;
        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
        }
    }
}

/// Permission to make one call, obtained from [`CircuitBreaker::try_acquire`].
#[derive(Debug)]
#[must_use = "a permit must be settled with the call outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool, generation: u64) -> Self {
        Self {
            breaker,
            trial,
            generation,
            settled: false,
        }
    }

    /// Returns true if this permit is the half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Settles the permit as a success.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, true);
    }

    /// Settles the permit as a retryable failure.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current mode.
    pub state: CircuitState,
    /// Consecutive retryable failures.
    pub consecutive_failures: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Time of the last recorded failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time of the last mode change.
    pub last_transition: DateTime<Utc>,
    /// Whether a half-open trial call is running.
    pub trial_in_flight: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(recovery),
        )
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert!(config.clone().with_failure_threshold(0).validate().is_err());
    }

    #[test]
    fn test_oversized_recovery_timeout_is_rejected() {
        let config = CircuitBreakerConfig {
            recovery_timeout_seconds: 1e30,
            ..CircuitBreakerConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.recovery_timeout(), Duration::MAX);

        let breaker = CircuitBreaker::new(config);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(matches!(
            breaker.try_acquire(),
            Err(PipelineError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_closed_to_open() {
        let breaker = breaker(3, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.try_acquire().unwrap_err();
        match err {
            PipelineError::CircuitOpen { retry_after } => {
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker(1, Duration::from_secs(10));
        breaker.record_failure();
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(matches!(
            breaker.try_acquire(),
            Err(PipelineError::CircuitOpen { .. })
        ));

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().unwrap().success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_trial_releases_slot() {
        let breaker = breaker(1, Duration::from_secs(1));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        drop(breaker.try_acquire().unwrap());
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert!(!stats.trial_in_flight);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_does_not_decide_half_open() {
        let breaker = breaker(1, Duration::from_secs(10));
        let stale = breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        let trial = breaker.try_acquire().unwrap();

        stale.success();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert!(stats.trial_in_flight);
        assert!(breaker.try_acquire().is_err());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_reopen() {
        let breaker = breaker(1, Duration::from_secs(10));
        let stale = breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        let trial = breaker.try_acquire().unwrap();

        stale.failure();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert!(stats.trial_in_flight);
        assert!(stats.last_failure_at.is_some());

        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_drop_keeps_newer_trial() {
        let breaker = breaker(1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        let first = breaker.try_acquire().unwrap();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        let second = breaker.try_acquire().unwrap();
        assert!(second.is_trial());

        drop(first);
        assert!(breaker.stats().trial_in_flight);
        second.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
