//! Validation gates.
//!
//! A gate inspects one stage's output and decides whether the pipeline may
//! advance. Gates are pure: the same output always yields the same decision.

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::state::{StageName, StageOutput};

/// Outcome of evaluating a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// The output is acceptable.
    Advance,
    /// The output is rejected and the run routes to the error stage.
    Reject {
        /// Human-readable reason.
        reason: String,
    },
}

impl GateDecision {
    /// Creates a rejection.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// Converts a rejection into a [`PipelineError::GateRejection`].
    pub fn into_result(self, stage: StageName) -> Result<(), PipelineError> {
        match self {
            Self::Advance => Ok(()),
            Self::Reject { reason } => Err(PipelineError::GateRejection { stage, reason }),
        }
    }
}

/// A validation gate for one stage's output.
pub trait Gate: Send + Sync {
    /// The stage whose output this gate checks.
    fn stage(&self) -> StageName;

    /// Evaluates the output without side effects.
    fn evaluate(&self, output: &StageOutput) -> GateDecision;
}

fn wrong_variant(expected: &str, output: &StageOutput) -> GateDecision {
    GateDecision::reject(format!(
        "expected {expected} output, got {} output",
        output.variant_name()
    ))
}

/// Accepts an Analysis result with a non-blank intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisGate;

impl Gate for AnalysisGate {
    fn stage(&self) -> StageName {
        StageName::Analyze
    }

    fn evaluate(&self, output: &StageOutput) -> GateDecision {
        match output {
            StageOutput::Analysis(analysis) if analysis.intent.trim().is_empty() => {
                GateDecision::reject("analysis produced an empty intent")
            }
            StageOutput::Analysis(_) => GateDecision::Advance,
            other => wrong_variant("analysis", other),
        }
    }
}

/// Accepts a Process result with content and sufficient confidence.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGate {
    min_confidence: f64,
}

impl ProcessGate {
    /// Creates a gate with an inclusive confidence threshold.
    #[must_use]
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Returns the threshold.
    #[must_use]
    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }
}

impl Default for ProcessGate {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Gate for ProcessGate {
    fn stage(&self) -> StageName {
        StageName::Process
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn evaluate(&self, output: &StageOutput) -> GateDecision {
        let StageOutput::Process(process) = output else {
            return wrong_variant("process", output);
        };
        if process.content.trim().is_empty() {
            return GateDecision::reject("process produced empty content");
        }
        // NaN fails this comparison as well.
        if !(process.confidence >= self.min_confidence) {
            return GateDecision::reject(format!(
                "confidence {} is below the minimum threshold {}",
                process.confidence, self.min_confidence
            ));
        }
        GateDecision::Advance
    }
}

/// Accepts a Synthesis result with non-blank text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesisGate;

impl Gate for SynthesisGate {
    fn stage(&self) -> StageName {
        StageName::Synthesize
    }

    fn evaluate(&self, output: &StageOutput) -> GateDecision {
        match output {
            StageOutput::Synthesis(synthesis) if synthesis.text.trim().is_empty() => {
                GateDecision::reject("synthesis produced no text")
            }
            StageOutput::Synthesis(_) => GateDecision::Advance,
            other => wrong_variant("synthesis", other),
        }
    }
}
