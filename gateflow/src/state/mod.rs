//! Accumulated state threaded through a pipeline run.
//!
//! The state is built once per request with only the message log populated.
//! Stage executors never touch it directly: they return a [`StateUpdate`] that
//! the state machine merges, which is where the invariants are enforced.

mod output;

pub use output::{
    AnalysisResult, Complexity, ProcessResult, StageOutput, SynthesisResult, TextFormat,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::PipelineError;
use crate::metrics::{MetricsMap, StageMetrics};

/// A stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Intent and entity extraction.
    Analyze,
    /// Drafts the answer content with a confidence score.
    Process,
    /// Streams the final user-facing text.
    Synthesize,
    /// Terminal fallback producing a user-safe response.
    Error,
}

impl StageName {
    /// Returns the lowercase stage label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Process => "process",
            Self::Synthesize => "synthesize",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user.
    User,
    /// The generative service, answering one stage.
    Assistant,
}

/// One entry in the exchanged-message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub role: Role,
    /// Raw message content.
    pub content: String,
    /// Stage that produced the message, for assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            stage: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates the raw response message of a stage.
    #[must_use]
    pub fn stage_response(stage: StageName, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            stage: Some(stage),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered, append-only log of exchanged messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    /// Creates a log from initial messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the messages in order.
    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the most recent user message.
    #[must_use]
    pub fn latest_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

/// Partial state produced by one stage executor.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    output: Option<StageOutput>,
    messages: Vec<Message>,
    metrics: Option<StageMetrics>,
    final_text: Option<String>,
}

impl StateUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stage output.
    #[must_use]
    pub fn with_output(mut self, output: StageOutput) -> Self {
        self.output = Some(output);
        self
    }

    /// Appends a message to the log.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Sets the stage's metrics entry.
    #[must_use]
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the final text directly (used by the error stage).
    #[must_use]
    pub fn with_final_text(mut self, text: impl Into<String>) -> Self {
        self.final_text = Some(text.into());
        self
    }

    /// Returns the stage output, if any.
    #[must_use]
    pub fn output(&self) -> Option<&StageOutput> {
        self.output.as_ref()
    }

    /// Returns the metrics entry, if any.
    #[must_use]
    pub fn metrics(&self) -> Option<&StageMetrics> {
        self.metrics.as_ref()
    }

    /// Returns the messages this update appends.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the final text carried by this update, if any.
    #[must_use]
    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }
}

/// The single value threaded through one pipeline run.
#[derive(Debug, Clone)]
pub struct AccumulatedState {
    messages: MessageLog,
    analysis: Option<AnalysisResult>,
    process: Option<ProcessResult>,
    synthesis: Option<SynthesisResult>,
    final_text: Option<String>,
    metrics: MetricsMap,
    correlation_id: String,
    actor_id: String,
}

impl AccumulatedState {
    /// Creates the initial state of a run.
    #[must_use]
    pub fn new(
        messages: Vec<Message>,
        correlation_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            messages: MessageLog::new(messages),
            analysis: None,
            process: None,
            synthesis: None,
            final_text: None,
            metrics: MetricsMap::new(),
            correlation_id: correlation_id.into(),
            actor_id: actor_id.into(),
        }
    }

    /// Returns the message log.
    #[must_use]
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Returns the Analysis result, once merged.
    #[must_use]
    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.analysis.as_ref()
    }

    /// Returns the Process result, once merged.
    #[must_use]
    pub fn process(&self) -> Option<&ProcessResult> {
        self.process.as_ref()
    }

    /// Returns the Synthesis result, once merged.
    #[must_use]
    pub fn synthesis(&self) -> Option<&SynthesisResult> {
        self.synthesis.as_ref()
    }

    /// Returns the final text, once produced.
    #[must_use]
    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }

    /// Returns the per-stage metrics.
    #[must_use]
    pub fn metrics(&self) -> &MetricsMap {
        &self.metrics
    }

    /// Returns the correlation identifier.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns the actor identifier.
    #[must_use]
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Merges a stage's update, enforcing upstream-before-downstream ordering
    /// and insert-once metrics.
    ///
    /// On error the state is left unchanged.
    pub fn merge(&mut self, update: StateUpdate) -> Result<(), PipelineError> {
        if let Some(output) = &update.output {
            self.check_output(output)?;
        }
        if update.final_text.is_some() && self.final_text.is_some() {
            return Err(PipelineError::InvalidState(
                "final text is already set".to_string(),
            ));
        }
        self.check_metrics(update.metrics.as_ref())?;

        self.apply_log_and_metrics(update.messages, update.metrics)?;
        match update.output {
            Some(StageOutput::Analysis(analysis)) => self.analysis = Some(analysis),
            Some(StageOutput::Process(process)) => self.process = Some(process),
            Some(StageOutput::Synthesis(synthesis)) => {
                self.final_text = Some(synthesis.text.clone());
                self.synthesis = Some(synthesis);
            }
            None => {}
        }
        if let Some(text) = update.final_text {
            self.final_text = Some(text);
        }
        Ok(())
    }

    /// Merges only the log and metrics of an update whose output was rejected.
    ///
    /// The stage still ran and incurred cost, so its metrics entry and raw
    /// response are kept; its output is discarded.
    pub fn merge_rejected(&mut self, update: StateUpdate) -> Result<(), PipelineError> {
        self.check_metrics(update.metrics.as_ref())?;
        self.apply_log_and_metrics(update.messages, update.metrics)
    }

    fn check_output(&self, output: &StageOutput) -> Result<(), PipelineError> {
        match output {
            StageOutput::Analysis(_) if self.analysis.is_some() => Err(PipelineError::InvalidState(
                "analysis result is already set".to_string(),
            )),
            StageOutput::Process(_) if self.analysis.is_none() => Err(PipelineError::InvalidState(
                "process result cannot precede the analysis result".to_string(),
            )),
            StageOutput::Process(_) if self.process.is_some() => Err(PipelineError::InvalidState(
                "process result is already set".to_string(),
            )),
            StageOutput::Synthesis(_) if self.process.is_none() => Err(PipelineError::InvalidState(
                "synthesis result cannot precede the process result".to_string(),
            )),
            StageOutput::Synthesis(_) if self.final_text.is_some() => Err(
                PipelineError::InvalidState("final text is already set".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn check_metrics(&self, metrics: Option<&StageMetrics>) -> Result<(), PipelineError> {
        match metrics {
            Some(entry) if self.metrics.contains(entry.stage) => Err(PipelineError::InvalidState(
                format!("metrics for stage '{}' were already recorded", entry.stage),
            )),
            _ => Ok(()),
        }
    }

    fn apply_log_and_metrics(
        &mut self,
        messages: Vec<Message>,
        metrics: Option<StageMetrics>,
    ) -> Result<(), PipelineError> {
        if let Some(entry) = metrics {
            self.metrics.insert(entry)?;
        }
        for message in messages {
            self.messages.push(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state() -> AccumulatedState {
        AccumulatedState::new(vec![Message::user("Explain photosynthesis")], "corr-1", "actor-1")
    }

    fn analysis() -> StageOutput {
        StageOutput::Analysis(AnalysisResult {
            intent: "explain".to_string(),
            key_entities: vec!["photosynthesis".to_string()],
            complexity: Complexity::Moderate,
            context: serde_json::Map::new(),
        })
    }

    fn process() -> StageOutput {
        StageOutput::Process(ProcessResult {
            content: "Plants make sugar".to_string(),
            confidence: 0.8,
            metadata: serde_json::Map::new(),
        })
    }

    #[test]
    fn test_initial_state_has_only_messages() {
        let state = state();
        assert_eq!(state.messages().len(), 1);
        assert!(state.analysis().is_none());
        assert!(state.process().is_none());
        assert!(state.final_text().is_none());
        assert!(state.metrics().is_empty());
        assert_eq!(state.correlation_id(), "corr-1");
        assert_eq!(state.actor_id(), "actor-1");
    }

    #[test]
    fn test_latest_user_message() {
        let log = MessageLog::new(vec![
            Message::user("first"),
            Message::stage_response(StageName::Analyze, "{}"),
            Message::user("second"),
            Message::stage_response(StageName::Process, "{}"),
        ]);
        assert_eq!(log.latest_user().unwrap().content, "second");
        assert!(MessageLog::default().latest_user().is_none());
    }

    #[test]
    fn test_merge_in_order() {
        let mut state = state();
        state
            .merge(
                StateUpdate::new()
                    .with_output(analysis())
                    .with_message(Message::stage_response(StageName::Analyze, "{}"))
                    .with_metrics(StageMetrics::new(StageName::Analyze)),
            )
            .unwrap();
        state
            .merge(StateUpdate::new().with_output(process()).with_metrics(StageMetrics::new(StageName::Process)))
            .unwrap();
        state
            .merge(StateUpdate::new().with_output(StageOutput::Synthesis(SynthesisResult::new(
                "Plants make sugar from light.".to_string(),
            ))))
            .unwrap();

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.metrics().len(), 2);
        assert_eq!(state.final_text(), Some("Plants make sugar from light."));
        assert_eq!(state.synthesis().unwrap().format, TextFormat::PlainText);
    }

    #[test]
    fn test_process_before_analysis_is_rejected_without_mutation() {
        let mut state = state();
        let err = state
            .merge(
                StateUpdate::new()
                    .with_output(process())
                    .with_message(Message::stage_response(StageName::Process, "{}"))
                    .with_metrics(StageMetrics::new(StageName::Process)),
            )
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidState(_)));
        assert_eq!(state.messages().len(), 1);
        assert!(state.metrics().is_empty());
    }

    #[test]
    fn test_metrics_are_never_overwritten() {
        let mut state = state();
        state
            .merge(StateUpdate::new().with_metrics(StageMetrics::new(StageName::Analyze)))
            .unwrap();
        let err = state
            .merge(StateUpdate::new().with_metrics(StageMetrics::new(StageName::Analyze)))
            .unwrap_err();
        assert!(err.to_string().contains("analyze"));
        assert_eq!(state.metrics().len(), 1);
    }

    #[test]
    fn test_merge_rejected_keeps_metrics_and_log_only() {
        let mut state = state();
        state
            .merge_rejected(
                StateUpdate::new()
                    .with_output(analysis())
                    .with_message(Message::stage_response(StageName::Analyze, "{\"intent\": \"\"}"))
                    .with_metrics(StageMetrics::new(StageName::Analyze)),
            )
            .unwrap();

        assert!(state.analysis().is_none());
        assert_eq!(state.messages().len(), 2);
        assert!(state.metrics().contains(StageName::Analyze));
    }

    #[test]
    fn test_final_text_is_set_once() {
        let mut state = state();
        state.merge(StateUpdate::new().with_final_text("sorry")).unwrap();
        assert!(state.merge(StateUpdate::new().with_final_text("again")).is_err());
        assert_eq!(state.final_text(), Some("sorry"));
    }

    #[test]
    fn test_stage_name_labels() {
        assert_eq!(StageName::Analyze.to_string(), "analyze");
        assert_eq!(StageName::Error.as_str(), "error");
        assert_eq!(serde_json::to_string(&StageName::Synthesize).unwrap(), r#""synthesize""#);
    }
}
