//! Pipeline builder with validation.

use std::sync::Arc;

use super::Pipeline;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::gateway::{CircuitBreaker, ResilientGateway};
use crate::metrics::{MetricsSink, TracingMetricsSink};
use crate::service::GenerativeService;

/// Builder for [`Pipeline`].
///
/// The circuit breaker is meant to be shared process-wide: build it once and
/// pass the same `Arc` to every pipeline that talks to the same service.
#[derive(Default)]
pub struct PipelineBuilder {
    service: Option<Arc<dyn GenerativeService>>,
    config: PipelineConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl PipelineBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the generative service.
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn GenerativeService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Injects a shared circuit breaker.
    ///
    /// Without one, a breaker is created from the configuration's
    /// `circuit_breaker` section.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Sets the metrics sink. Defaults to [`TracingMetricsSink`].
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if no service was provided or the
    /// configuration is out of range.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let service = self
            .service
            .ok_or_else(|| PipelineError::Config("a generative service is required".to_string()))?;
        self.config.validate()?;

        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone())));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingMetricsSink) as Arc<dyn MetricsSink>);
        let gateway = ResilientGateway::new(breaker, self.config.retry.clone(), sink.clone());

        Ok(Pipeline::from_parts(service, self.config, gateway, sink))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("has_service", &self.service.is_some())
            .field("config", &self.config)
            .field("shared_breaker", &self.breaker.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedService;

    #[test]
    fn test_build_requires_service() {
        let err = PipelineBuilder::new().build().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_build_validates_config() {
        let err = PipelineBuilder::new()
            .with_service(Arc::new(ScriptedService::new()))
            .with_config(PipelineConfig::default().with_min_confidence(2.0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn test_injected_breaker_is_shared() {
        let breaker = Arc::new(CircuitBreaker::default());
        let service: Arc<dyn GenerativeService> = Arc::new(ScriptedService::new());
        let a = PipelineBuilder::new()
            .with_service(service.clone())
            .with_circuit_breaker(breaker.clone())
            .build()
            .unwrap();
        let b = PipelineBuilder::new()
            .with_service(service)
            .with_circuit_breaker(breaker.clone())
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(a.circuit_breaker(), &breaker));
        assert!(Arc::ptr_eq(b.circuit_breaker(), &breaker));
    }
}
