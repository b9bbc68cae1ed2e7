//! Instruction strings and prompt assembly for each stage.

use crate::state::{AnalysisResult, ProcessResult};

pub(crate) const ANALYZE_INSTRUCTION: &str = "Identify the user's intent, the key entities the answer must cover, \
and the request's complexity (simple, moderate or complex). Respond with JSON only.";

pub(crate) const PROCESS_INSTRUCTION: &str = "Draft the substance of the answer to the analyzed request. \
Report your confidence in the draft as a number between 0 and 1. Respond with JSON only.";

pub(crate) const SYNTHESIZE_INSTRUCTION: &str = "Write the final answer for the user from the draft below. \
Be clear and direct, and do not mention the draft or any confidence score.";

/// User content for the Process stage.
pub(crate) fn process_prompt(question: &str, analysis: &AnalysisResult) -> String {
    let entities = if analysis.key_entities.is_empty() {
        "none".to_string()
    } else {
        analysis.key_entities.join(", ")
    };
    let mut prompt = format!(
        "Request: {question}\nIntent: {}\nKey entities: {entities}\nComplexity: {}",
        analysis.intent, analysis.complexity
    );
    if !analysis.context.is_empty() {
        prompt.push_str("\nContext: ");
        prompt.push_str(&serde_json::Value::Object(analysis.context.clone()).to_string());
    }
    prompt
}

/// User content for the Synthesize stage.
pub(crate) fn synthesize_prompt(question: &str, process: &ProcessResult) -> String {
    format!("Request: {question}\nDraft:\n{}", process.content)
}
