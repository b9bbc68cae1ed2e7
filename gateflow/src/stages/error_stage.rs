//! Terminal fallback stage.
//!
//! Turns any failure or rejection into a fixed, user-presentable message. The
//! text depends only on the error kind and the stage it came from, and never
//! carries service internals.

use std::time::Duration;

use crate::errors::{truncate_for_log, ErrorKind, PipelineError};
use crate::metrics::{ErrorRecord, StageMetrics};
use crate::state::{Message, StageName, StateUpdate};

const REASON_LIMIT: usize = 200;

/// Produces the response of a run that could not complete normally.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorStage;

impl ErrorStage {
    /// Returns the user-facing text for a failure.
    #[must_use]
    pub fn user_message(&self, origin: StageName, kind: ErrorKind) -> &'static str {
        match (kind, origin) {
            (ErrorKind::GateRejection, StageName::Analyze) => {
                "I couldn't work out what you're asking. Could you rephrase your question with a little more detail?"
            }
            (ErrorKind::GateRejection, StageName::Process) => {
                "I'm not confident enough in an answer to share it. Could you add more detail or narrow the question?"
            }
            (ErrorKind::GateRejection, _) => {
                "I wasn't able to put together a response this time. Please try again."
            }
            (ErrorKind::CircuitOpen, _) => {
                "The assistant is temporarily unavailable. Please try again in a little while."
            }
            (ErrorKind::RetryableServiceError, _) => {
                "The assistant service is having trouble right now. Please try again shortly."
            }
            (ErrorKind::NonRetryableServiceError, _) => {
                "Your request couldn't be processed. Please try rephrasing it."
            }
            (ErrorKind::TimeoutExceeded, _) => {
                "Your request took too long to process. Please try again, perhaps with a simpler question."
            }
            (ErrorKind::SchemaMismatch, _) => {
                "Something went wrong while preparing your answer. Please try again."
            }
            (ErrorKind::InvalidState | ErrorKind::Config | ErrorKind::Cancelled, _) => {
                "Something went wrong while handling your request. Please try again."
            }
        }
    }

    /// Builds the state update for a failure that happened in `origin`.
    ///
    /// This never fails.
    #[must_use]
    pub fn respond(&self, origin: StageName, error: &PipelineError, elapsed: Duration) -> StateUpdate {
        let kind = error.kind();
        let text = self.user_message(origin, kind);
        let record = ErrorRecord {
            origin,
            kind,
            reason: truncate_for_log(&error.diagnostic(), REASON_LIMIT),
        };

        StateUpdate::new()
            .with_message(Message::stage_response(StageName::Error, text))
            .with_metrics(
                StageMetrics::new(StageName::Error)
                    .with_elapsed(elapsed)
                    .with_error(record),
            )
            .with_final_text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;

    const ALL_KINDS: [ErrorKind; 9] = [
        ErrorKind::CircuitOpen,
        ErrorKind::RetryableServiceError,
        ErrorKind::NonRetryableServiceError,
        ErrorKind::SchemaMismatch,
        ErrorKind::GateRejection,
        ErrorKind::TimeoutExceeded,
        ErrorKind::Cancelled,
        ErrorKind::InvalidState,
        ErrorKind::Config,
    ];

    #[test]
    fn test_every_kind_has_text() {
        for stage in [StageName::Analyze, StageName::Process, StageName::Synthesize] {
            for kind in ALL_KINDS {
                assert!(!ErrorStage.user_message(stage, kind).trim().is_empty());
            }
        }
    }

    #[test]
    fn test_text_is_deterministic() {
        let a = ErrorStage.user_message(StageName::Process, ErrorKind::GateRejection);
        let b = ErrorStage.user_message(StageName::Process, ErrorKind::GateRejection);
        assert_eq!(a, b);
        assert_ne!(
            a,
            ErrorStage.user_message(StageName::Analyze, ErrorKind::GateRejection)
        );
    }

    #[test]
    fn test_respond_records_origin_and_reason() {
        let error = PipelineError::GateRejection {
            stage: StageName::Process,
            reason: "confidence 0.3 is below the minimum threshold 0.5".to_string(),
        };
        let update = ErrorStage.respond(StageName::Process, &error, Duration::from_millis(1));

        let metrics = update.metrics().unwrap();
        assert_eq!(metrics.stage, StageName::Error);
        let record = metrics.error.as_ref().unwrap();
        assert_eq!(record.origin, StageName::Process);
        assert_eq!(record.kind, ErrorKind::GateRejection);
        assert!(record.reason.contains("0.3"));
        assert!(!update.final_text().unwrap().is_empty());
    }

    #[test]
    fn test_respond_hides_service_internals() {
        let error = PipelineError::NonRetryableService(
            ServiceError::from_http_status(400, "secret internal trace"),
        );
        let update = ErrorStage.respond(StageName::Analyze, &error, Duration::ZERO);
        assert!(!update.final_text().unwrap().contains("secret"));
        assert!(!update.metrics().unwrap().error.as_ref().unwrap().reason.contains("secret"));
    }
}
