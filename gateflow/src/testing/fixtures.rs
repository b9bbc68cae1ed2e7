//! Test fixtures: canned structured results and pre-populated states.

use serde_json::json;

use crate::state::{
    AccumulatedState, AnalysisResult, Message, ProcessResult, StageOutput, StateUpdate,
};

/// Correlation identifier used by fixture states.
pub const CORRELATION_ID: &str = "corr-test";

/// Actor identifier used by fixture states.
pub const ACTOR_ID: &str = "actor-test";

/// A well-formed Analyze result about photosynthesis.
#[must_use]
pub fn analysis_json() -> serde_json::Value {
    json!({
        "intent": "explain photosynthesis",
        "key_entities": ["photosynthesis", "chlorophyll", "sunlight"],
        "complexity": "moderate",
        "context": {"summary": "The user wants a short explanation of how plants make food."}
    })
}

/// A well-formed Process result with the given confidence.
#[must_use]
pub fn process_json(confidence: f64) -> serde_json::Value {
    json!({
        "content": "Plants use chlorophyll to turn sunlight, water and carbon dioxide into glucose and oxygen.",
        "confidence": confidence,
        "metadata": {"sources": "general biology"}
    })
}

/// A state holding a single user message.
#[must_use]
pub fn initial_state(question: &str) -> AccumulatedState {
    AccumulatedState::new(vec![Message::user(question)], CORRELATION_ID, ACTOR_ID)
}

/// A state whose Analyze stage has completed.
///
/// # Panics
///
/// Panics if the canned analysis does not decode.
#[must_use]
pub fn analyzed_state(question: &str) -> AccumulatedState {
    let mut state = initial_state(question);
    let analysis: AnalysisResult =
        serde_json::from_value(analysis_json()).expect("analysis fixture decodes");
    state
        .merge(StateUpdate::new().with_output(StageOutput::Analysis(analysis)))
        .expect("analysis merges into a fresh state");
    state
}

/// A state whose Analyze and Process stages have completed.
///
/// # Panics
///
/// Panics if the canned process result does not decode.
#[must_use]
pub fn processed_state(question: &str, confidence: f64) -> AccumulatedState {
    let mut state = analyzed_state(question);
    let process: ProcessResult =
        serde_json::from_value(process_json(confidence)).expect("process fixture decodes");
    state
        .merge(StateUpdate::new().with_output(StageOutput::Process(process)))
        .expect("process merges after analysis");
    state
}
