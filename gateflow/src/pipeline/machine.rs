//! The pipeline's state machine as a plain enum and a pure transition
//! function.

use std::fmt;

use crate::errors::PipelineError;
use crate::state::StageName;

/// A failure that routes the run to the error stage.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// Stage that failed or whose output was rejected.
    pub origin: StageName,
    /// What went wrong.
    pub error: PipelineError,
}

/// Position of a run in the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineStage {
    /// Nothing has run yet.
    Start,
    /// Running the Analyze stage.
    Analyze,
    /// Running the Process stage.
    Process,
    /// Running the Synthesize stage.
    Synthesize,
    /// Producing the fallback response for a failure.
    Error(StageFailure),
    /// Terminal.
    Done,
}

/// What happened in the current position.
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// The stage ran and its output passed the gate.
    Completed,
    /// The stage failed or its output was rejected.
    Failed(StageFailure),
}

impl PipelineStage {
    /// Computes the next position.
    ///
    /// Only the three service-backed stages have an edge to `Error`; the
    /// error stage always leads to `Done`, and `Done` is absorbing.
    #[must_use]
    pub fn transition(self, event: StageEvent) -> Self {
        match (self, event) {
            (Self::Start, _) => Self::Analyze,
            (Self::Analyze, StageEvent::Completed) => Self::Process,
            (Self::Process, StageEvent::Completed) => Self::Synthesize,
            (Self::Synthesize, StageEvent::Completed) => Self::Done,
            (Self::Analyze | Self::Process | Self::Synthesize, StageEvent::Failed(failure)) => {
                Self::Error(failure)
            }
            (Self::Error(_) | Self::Done, _) => Self::Done,
        }
    }

    /// Returns the service-backed stage at this position, if any.
    #[must_use]
    pub fn stage_name(&self) -> Option<StageName> {
        match self {
            Self::Analyze => Some(StageName::Analyze),
            Self::Process => Some(StageName::Process),
            Self::Synthesize => Some(StageName::Synthesize),
            Self::Start | Self::Error(_) | Self::Done => None,
        }
    }

    /// Returns true at `Done`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Analyze => write!(f, "analyze"),
            Self::Process => write!(f, "process"),
            Self::Synthesize => write!(f, "synthesize"),
            Self::Error(failure) => write!(f, "error({})", failure.origin),
            Self::Done => write!(f, "done"),
        }
    }
}
