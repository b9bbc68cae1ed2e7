//! Typed stage outputs.
//!
//! Each variant is produced by exactly one stage and handed, immutably, to the
//! stage's gate and then to the state merge.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::StageName;

/// Closed classification of how demanding a request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// A direct question with a short answer.
    #[serde(alias = "Simple", alias = "SIMPLE")]
    Simple,
    /// Needs some explanation or a few steps.
    #[serde(alias = "Moderate", alias = "MODERATE")]
    Moderate,
    /// Multi-part or open-ended.
    #[serde(alias = "Complex", alias = "COMPLEX")]
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Structured result of the Analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// What the user is asking for.
    pub intent: String,
    /// Entities the answer must address.
    #[serde(default)]
    pub key_entities: Vec<String>,
    /// How demanding the request is.
    pub complexity: Complexity,
    /// Free-form context extracted by the model.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Structured result of the Process stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// The drafted answer content.
    pub content: String,
    /// Model-reported confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ProcessResult {
    /// Checks the constraints serde cannot express.
    pub fn check_bounds(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "confidence must be within [0.0, 1.0], got {}",
                self.confidence
            ));
        }
        Ok(())
    }
}

/// Closed classification of the final text's formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    /// Unformatted prose.
    PlainText,
    /// Markdown headings, lists, emphasis or code fences.
    Markdown,
    /// A JSON document.
    Json,
}

impl TextFormat {
    /// Classifies a finished text.
    #[must_use]
    pub fn classify(text: &str) -> Self {
        let trimmed = text.trim();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            return Self::Json;
        }

        let markdown_line = |line: &str| {
            let line = line.trim_start();
            line.starts_with('#')
                || line.starts_with("```")
                || line.starts_with("- ")
                || line.starts_with("* ")
                || line.starts_with("> ")
                || line
                    .split_once(". ")
                    .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        };
        if trimmed.contains("**") || trimmed.lines().any(markdown_line) {
            Self::Markdown
        } else {
            Self::PlainText
        }
    }
}

impl fmt::Display for TextFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlainText => write!(f, "plain_text"),
            Self::Markdown => write!(f, "markdown"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Final result of the Synthesize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    /// The complete streamed text.
    pub text: String,
    /// Formatting classification of `text`.
    pub format: TextFormat,
}

impl SynthesisResult {
    /// Builds a result, classifying the text's format.
    #[must_use]
    pub fn new(text: String) -> Self {
        let format = TextFormat::classify(&text);
        Self { text, format }
    }
}

/// The typed result of one stage, before it is merged into state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum StageOutput {
    /// Produced by Analyze.
    Analysis(AnalysisResult),
    /// Produced by Process.
    Process(ProcessResult),
    /// Produced by Synthesize.
    Synthesis(SynthesisResult),
}

impl StageOutput {
    /// The stage that owns this variant.
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            Self::Analysis(_) => StageName::Analyze,
            Self::Process(_) => StageName::Process,
            Self::Synthesis(_) => StageName::Synthesize,
        }
    }

    /// Short variant label for diagnostics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Analysis(_) => "analysis",
            Self::Process(_) => "process",
            Self::Synthesis(_) => "synthesis",
        }
    }
}
