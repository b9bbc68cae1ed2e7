//! Test assertions for run outcomes and event streams.

use crate::errors::ErrorKind;
use crate::relay::PipelineEvent;
use crate::state::StageName;

use crate::pipeline::RunOutcome;

/// Asserts that the run completed through Synthesize.
pub fn assert_succeeded(outcome: &RunOutcome) {
    assert!(
        outcome.succeeded,
        "Expected a successful run, got error: {:?}",
        outcome.error()
    );
    assert!(
        !outcome.summary.stages.contains(StageName::Error),
        "Successful run has an error stage entry"
    );
}

/// Asserts that the run ended in the error stage because `origin` failed with
/// `kind`.
pub fn assert_routed_to_error(outcome: &RunOutcome, origin: StageName, kind: ErrorKind) {
    assert!(!outcome.succeeded, "Expected a failed run, got success");
    assert!(
        !outcome.final_text.trim().is_empty(),
        "Failed run has no user-facing text"
    );
    let record = outcome
        .error()
        .unwrap_or_else(|| panic!("Failed run has no error record: {:?}", outcome.summary));
    assert_eq!(record.origin, origin, "Unexpected error origin");
    assert_eq!(record.kind, kind, "Unexpected error kind: {}", record.reason);
}

/// Asserts that the events hold `tokens` in order followed by exactly one
/// terminal event, and returns that event's outcome.
pub fn assert_token_sequence<'a>(events: &'a [PipelineEvent], tokens: &[&str]) -> &'a RunOutcome {
    let received: Vec<&str> = events.iter().filter_map(PipelineEvent::as_token).collect();
    assert_eq!(received, tokens, "Unexpected token sequence");

    let Some(PipelineEvent::Completed(outcome)) = events.last() else {
        panic!("Event stream does not end with a completion: {events:?}");
    };
    let completions = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Completed(_)))
        .count();
    assert_eq!(completions, 1, "Expected exactly one completion event");
    outcome
}

/// Asserts that the stages with metrics entries are exactly `expected`, in
/// order.
pub fn assert_metrics_stages(outcome: &RunOutcome, expected: &[StageName]) {
    assert_eq!(
        outcome.summary.stages.stages(),
        expected,
        "Unexpected metrics entries"
    );
}
