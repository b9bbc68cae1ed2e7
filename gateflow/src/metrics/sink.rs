//! Metrics sink trait and implementations.

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{AttemptRecord, RunSummary, StageMetrics};

/// Receives stage metrics, attempt records and run summaries.
///
/// Calls happen inline on the pipeline task, so implementations should not
/// block.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    /// Records the metrics entry of an executed stage.
    fn record_stage(&self, metrics: &StageMetrics);

    /// Records one gateway attempt.
    fn record_attempt(&self, record: &AttemptRecord);

    /// Records the summary of a finished run.
    fn record_run_summary(&self, summary: &RunSummary);
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn record_stage(&self, _metrics: &StageMetrics) {}

    fn record_attempt(&self, _record: &AttemptRecord) {}

    fn record_run_summary(&self, _summary: &RunSummary) {}
}

/// A sink that emits structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_stage(&self, metrics: &StageMetrics) {
        info!(
            stage = %metrics.stage,
            elapsed_ms = metrics.elapsed_ms,
            input_tokens = metrics.input_tokens,
            output_tokens = metrics.output_tokens,
            cost_usd = metrics.cost_usd,
            model = metrics.model.as_deref().unwrap_or("-"),
            error_kind = metrics.error.as_ref().map(|e| e.kind.as_str()),
            "Stage metrics"
        );
    }

    fn record_attempt(&self, record: &AttemptRecord) {
        debug!(
            stage = %record.stage,
            attempt = record.attempt,
            elapsed_ms = record.elapsed_ms,
            outcome = record.outcome.as_str(),
            "Service attempt"
        );
    }

    fn record_run_summary(&self, summary: &RunSummary) {
        info!(
            correlation_id = %summary.correlation_id,
            actor_id = %summary.actor_id,
            succeeded = summary.succeeded,
            total_elapsed_ms = summary.total_elapsed_ms,
            total_cost_usd = summary.total_cost_usd,
            total_input_tokens = summary.total_input_tokens,
            total_output_tokens = summary.total_output_tokens,
            stages = summary.stages.len(),
            "Pipeline run summary"
        );
    }
}

/// A sink that keeps everything in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingMetricsSink {
    stages: RwLock<Vec<StageMetrics>>,
    attempts: RwLock<Vec<AttemptRecord>>,
    summaries: RwLock<Vec<RunSummary>>,
}

impl CollectingMetricsSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns recorded stage entries.
    #[must_use]
    pub fn stages(&self) -> Vec<StageMetrics> {
        self.stages.read().clone()
    }

    /// Returns recorded attempts.
    #[must_use]
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.read().clone()
    }

    /// Returns recorded run summaries.
    #[must_use]
    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.read().clone()
    }

    /// Clears everything.
    pub fn clear(&self) {
        self.stages.write().clear();
        self.attempts.write().clear();
        self.summaries.write().clear();
    }
}

impl MetricsSink for CollectingMetricsSink {
    fn record_stage(&self, metrics: &StageMetrics) {
        self.stages.write().push(metrics.clone());
    }

    fn record_attempt(&self, record: &AttemptRecord) {
        self.attempts.write().push(record.clone());
    }

    fn record_run_summary(&self, summary: &RunSummary) {
        self.summaries.write().push(summary.clone());
    }
}
