//! Contract with the remote generative-text service.
//!
//! The pipeline only depends on [`GenerativeService`]. Adapters classify their
//! own transport failures into [`ServiceError`] kinds so the gateway can
//! decide what to retry.

#[cfg(feature = "gemini")]
pub mod gemini;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::StageConfig;
use crate::errors::ServiceError;

/// A stream of text fragments, ending with an optional usage report.
pub type TextStream = BoxStream<'static, Result<StreamChunk, ServiceError>>;

/// Token usage reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl Usage {
    /// Creates a usage report.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// One item of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// An incremental piece of text.
    Fragment(String),
    /// Trailing usage report.
    Usage(Usage),
}

/// Sampling settings for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens.
    pub max_output_tokens: u32,
}

impl From<&StageConfig> for GenerationConfig {
    fn from(config: &StageConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

/// JSON schema the structured result must follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Short name used in logs.
    pub name: String,
    /// OpenAPI-style schema object.
    pub schema: serde_json::Value,
}

impl SchemaDescriptor {
    /// Schema of the Analyze stage's result.
    #[must_use]
    pub fn analysis() -> Self {
        Self {
            name: "analysis".to_string(),
            schema: serde_json::json!({
                "type": "OBJECT",
                "properties": {
                    "intent": {"type": "STRING"},
                    "key_entities": {"type": "ARRAY", "items": {"type": "STRING"}},
                    "complexity": {"type": "STRING", "enum": ["simple", "moderate", "complex"]},
                    "context": {"type": "OBJECT", "properties": {"summary": {"type": "STRING"}}}
                },
                "required": ["intent", "key_entities", "complexity"]
            }),
        }
    }

    /// Schema of the Process stage's result.
    #[must_use]
    pub fn process() -> Self {
        Self {
            name: "process".to_string(),
            schema: serde_json::json!({
                "type": "OBJECT",
                "properties": {
                    "content": {"type": "STRING"},
                    "confidence": {"type": "NUMBER"},
                    "metadata": {"type": "OBJECT", "properties": {"sources": {"type": "STRING"}}}
                },
                "required": ["content", "confidence"]
            }),
        }
    }
}

/// One call to the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    /// System-level instruction.
    pub system_instruction: String,
    /// The user-turn content.
    pub user_content: String,
    /// Structured-output schema, for structured stages.
    pub schema: Option<SchemaDescriptor>,
    /// Sampling settings.
    pub generation: GenerationConfig,
}

/// Body of a non-streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseContent {
    /// Parsed structured output.
    Structured(serde_json::Value),
    /// Raw text.
    Text(String),
}

impl ResponseContent {
    /// Returns the content as text, for the message log.
    #[must_use]
    pub fn raw_text(&self) -> String {
        match self {
            Self::Structured(value) => value.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// A non-streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    /// The answer body.
    pub content: ResponseContent,
    /// Reported token usage.
    pub usage: Usage,
}

/// The remote generative-text service.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Makes one structured or plain call.
    async fn invoke(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError>;

    /// Opens a streamed call.
    ///
    /// Failures while opening are returned directly; failures after the
    /// stream is open arrive as stream items.
    async fn invoke_streaming(&self, request: &ServiceRequest) -> Result<TextStream, ServiceError>;
}
