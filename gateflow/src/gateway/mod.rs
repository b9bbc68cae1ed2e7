//! Resilient call gateway: retry with backoff and jitter behind a shared
//! circuit breaker.

mod circuit_breaker;
#[allow(clippy::module_inception)]
mod gateway;
mod retry;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use gateway::ResilientGateway;
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig, RetryState};
