//! Gemini REST adapter.
//!
//! Talks to `models/{model}:generateContent` for structured stages and to
//! `models/{model}:streamGenerateContent?alt=sse` for the streamed stage.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    GenerativeService, ResponseContent, ServiceRequest, ServiceResponse, StreamChunk, TextStream,
    Usage,
};
use crate::errors::{PipelineError, ServiceError};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Connection settings for the Gemini adapter.
#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key sent in the `x-goog-api-key` header.
    pub api_key: String,
    /// API root URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Transport timeout for one HTTP request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: f64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> f64 {
    120.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

impl GeminiConfig {
    /// Creates a configuration with an API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }

    /// Reads `GEMINI_API_KEY` (or `GOOGLE_API_KEY`) and optional
    /// `GEMINI_BASE_URL`.
    pub fn from_env() -> Result<Self, PipelineError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                PipelineError::Config("GEMINI_API_KEY or GOOGLE_API_KEY must be set".to_string())
            })?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
            config.base_url = base_url;
        }
        Ok(config)
    }

    /// Sets the API root URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the transport timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_seconds = timeout.as_secs_f64();
        self
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .finish()
    }
}

/// [`GenerativeService`] backed by the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiService {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiService {
    /// Creates the adapter and its HTTP client.
    pub fn new(config: GeminiConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_seconds.max(0.0)))
            .connect_timeout(Duration::from_secs_f64(config.connect_timeout_seconds.max(0.0)))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{model}:{method}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response, ServiceError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::from_http_status(status.as_u16(), body))
    }
}

#[async_trait]
impl GenerativeService for GeminiService {
    async fn invoke(&self, request: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let url = self.endpoint(&request.generation.model, "generateContent");
        debug!(model = %request.generation.model, structured = request.schema.is_some(), "Gemini generateContent");

        let response = self.post(url, &request_body(request)).await?;
        let raw = response.text().await.map_err(classify_transport)?;
        let body: Value = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::server(502, format!("undecodable response envelope: {e}"))
                .with_raw_body(raw.clone())
        })?;

        if let Some(reason) = block_reason(&body) {
            return Err(ServiceError::validation(format!("prompt blocked: {reason}")).with_raw_body(raw));
        }

        let text = candidate_text(&body);
        let usage = usage_of(&body).unwrap_or_default();
        let content = match (&request.schema, serde_json::from_str::<Value>(&text)) {
            (Some(_), Ok(value)) => ResponseContent::Structured(value),
            _ => ResponseContent::Text(text),
        };
        Ok(ServiceResponse { content, usage })
    }

    async fn invoke_streaming(&self, request: &ServiceRequest) -> Result<TextStream, ServiceError> {
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&request.generation.model, "streamGenerateContent")
        );
        debug!(model = %request.generation.model, "Gemini streamGenerateContent");

        let response = self.post(url, &request_body(request)).await?;
        let mut byte_stream = response.bytes_stream();

        let stream = stream! {
            let mut buffer = String::new();
            let mut usage: Option<Usage> = None;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(classify_transport(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    if let Some(reason) = block_reason(&event) {
                        yield Err(ServiceError::validation(format!("response blocked: {reason}")));
                        return;
                    }
                    let text = candidate_text(&event);
                    if !text.is_empty() {
                        yield Ok(StreamChunk::Fragment(text));
                    }
                    if let Some(reported) = usage_of(&event) {
                        usage = Some(reported);
                    }
                }
            }

            if let Some(usage) = usage {
                yield Ok(StreamChunk::Usage(usage));
            }
        };

        Ok(stream.boxed())
    }
}

fn request_body(request: &ServiceRequest) -> Value {
    let mut generation = json!({
        "temperature": request.generation.temperature,
        "maxOutputTokens": request.generation.max_output_tokens,
    });
    if let Some(schema) = &request.schema {
        generation["responseMimeType"] = json!("application/json");
        generation["responseSchema"] = schema.schema.clone();
    }

    json!({
        "systemInstruction": {"parts": [{"text": request.system_instruction}]},
        "contents": [{"role": "user", "parts": [{"text": request.user_content}]}],
        "generationConfig": generation,
    })
}

fn candidate_text(body: &Value) -> String {
    body.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn usage_of(body: &Value) -> Option<Usage> {
    let metadata = body.get("usageMetadata")?;
    let count = |field: &str| metadata.get(field).and_then(Value::as_u64).unwrap_or(0);
    Some(Usage::new(
        count("promptTokenCount"),
        count("candidatesTokenCount"),
    ))
}

fn block_reason(body: &Value) -> Option<String> {
    body.pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn classify_transport(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::timeout(format!("request timed out: {err}"))
    } else if let Some(status) = err.status() {
        ServiceError::from_http_status(status.as_u16(), String::new())
    } else {
        ServiceError::connection(format!("transport failure: {err}"))
    }
}
