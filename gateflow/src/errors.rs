//! Error types for the gateflow pipeline.
//!
//! Two layers live here: [`ServiceError`] is what a generative-service adapter
//! returns for a single call, already classified as retryable or not.
//! [`PipelineError`] is the taxonomy the state machine routes on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::state::StageName;

/// Maximum number of characters of a raw service body kept for diagnostics.
pub const RAW_RESPONSE_LOG_LIMIT: usize = 512;

/// Classification of a failed call to the generative service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// The call did not complete in time at the transport level.
    Timeout,
    /// The connection could not be established or was reset.
    Connection,
    /// The service answered with a 5xx status.
    Server,
    /// The service asked us to slow down (429).
    RateLimited,
    /// Credentials were missing or rejected.
    Authentication,
    /// The request itself was malformed (400).
    MalformedRequest,
    /// The service rejected the request content.
    Validation,
}

impl ServiceErrorKind {
    /// Returns true when another attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::Server | Self::RateLimited
        )
    }

    /// Returns the snake_case label for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Server => "server",
            Self::RateLimited => "rate_limited",
            Self::Authentication => "authentication",
            Self::MalformedRequest => "malformed_request",
            Self::Validation => "validation",
        }
    }

    /// Maps an HTTP status code to a classification.
    ///
    /// Returns `None` for statuses that are not failures.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=399 => None,
            400 => Some(Self::MalformedRequest),
            401 | 403 => Some(Self::Authentication),
            408 => Some(Self::Timeout),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::Server),
            _ => Some(Self::Validation),
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from one call to the generative service.
#[derive(Debug, Clone, Error)]
#[error("{kind} error from generative service: {message}")]
pub struct ServiceError {
    /// The failure classification.
    pub kind: ServiceErrorKind,
    /// Short human-readable description.
    pub message: String,
    /// HTTP status, when the transport has one.
    pub status: Option<u16>,
    /// Raw response body, kept for logs only.
    pub raw_body: Option<String>,
}

impl ServiceError {
    /// Creates a new service error.
    #[must_use]
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            raw_body: None,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Timeout, message)
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Connection, message)
    }

    /// Creates a server (5xx) error.
    #[must_use]
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Server, message).with_status(status)
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::RateLimited, message).with_status(429)
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Authentication, message)
    }

    /// Creates a malformed-request error.
    #[must_use]
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::MalformedRequest, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Validation, message)
    }

    /// Classifies a non-success HTTP response.
    #[must_use]
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let kind = ServiceErrorKind::from_status(status).unwrap_or(ServiceErrorKind::Validation);
        Self::new(kind, format!("service responded with status {status}"))
            .with_status(status)
            .with_raw_body(body)
    }

    /// Sets the HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches the raw response body.
    #[must_use]
    pub fn with_raw_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    /// Returns true when another attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Stable label for each [`PipelineError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Breaker tripped; call not attempted.
    CircuitOpen,
    /// Retryable failure surfaced after retries were exhausted.
    RetryableServiceError,
    /// Authentication or malformed-request failure.
    NonRetryableServiceError,
    /// Structured result did not match the expected shape.
    SchemaMismatch,
    /// Business-rule or confidence check failed.
    GateRejection,
    /// Stage wall-clock budget exceeded.
    TimeoutExceeded,
    /// Caller cancelled the run.
    Cancelled,
    /// A state invariant would have been violated.
    InvalidState,
    /// Invalid configuration.
    Config,
}

impl ErrorKind {
    /// Returns the snake_case label for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RetryableServiceError => "retryable_service_error",
            Self::NonRetryableServiceError => "non_retryable_service_error",
            Self::SchemaMismatch => "schema_mismatch",
            Self::GateRejection => "gate_rejection",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::Cancelled => "cancelled",
            Self::InvalidState => "invalid_state",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The circuit breaker is open and the call was not attempted.
    #[error("circuit breaker open; retry after {}ms", retry_after.as_millis())]
    CircuitOpen {
        /// Time remaining until the breaker admits a trial call.
        retry_after: Duration,
    },

    /// A retryable failure persisted through every allowed attempt.
    #[error("service unavailable after {attempts} attempt(s): {source}")]
    RetryableService {
        /// Number of attempts made.
        attempts: u32,
        /// The last failure observed.
        source: ServiceError,
    },

    /// A failure that retrying cannot fix.
    #[error("service call rejected: {0}")]
    NonRetryableService(ServiceError),

    /// The service answered, but not in the expected shape.
    #[error("stage '{stage}' received a malformed result: {message}")]
    SchemaMismatch {
        /// Stage that decoded the result.
        stage: StageName,
        /// What did not match.
        message: String,
        /// Truncated raw response.
        raw: Option<String>,
    },

    /// A validation gate rejected a stage's output.
    #[error("gate rejected '{stage}' output: {reason}")]
    GateRejection {
        /// Stage whose output was rejected.
        stage: StageName,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// A stage exceeded its wall-clock budget.
    #[error("stage '{stage}' exceeded its {}ms timeout", timeout.as_millis())]
    TimeoutExceeded {
        /// Stage that timed out.
        stage: StageName,
        /// The configured budget.
        timeout: Duration,
    },

    /// The caller cancelled the run.
    #[error("pipeline cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },

    /// A state invariant would have been violated.
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),

    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Creates a schema mismatch error, truncating the raw response.
    #[must_use]
    pub fn schema_mismatch(stage: StageName, message: impl Into<String>, raw: Option<&str>) -> Self {
        Self::SchemaMismatch {
            stage,
            message: message.into(),
            raw: raw.map(|r| truncate_for_log(r, RAW_RESPONSE_LOG_LIMIT)),
        }
    }

    /// Wraps a service error that ended a call, by its classification.
    #[must_use]
    pub fn from_service(error: ServiceError, attempts: u32) -> Self {
        if error.is_retryable() {
            Self::RetryableService {
                attempts,
                source: error,
            }
        } else {
            Self::NonRetryableService(error)
        }
    }

    /// Returns the stable kind label.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetryableService { .. } => ErrorKind::RetryableServiceError,
            Self::NonRetryableService(_) => ErrorKind::NonRetryableServiceError,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::GateRejection { .. } => ErrorKind::GateRejection,
            Self::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true for system faults, false for expected input-quality
    /// outcomes (gate rejections) and caller cancellation.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::GateRejection { .. } | Self::Cancelled { .. })
    }

    /// Returns true when the caller gave up.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the truncated raw service response, if one is attached.
    #[must_use]
    pub fn raw_response(&self) -> Option<String> {
        match self {
            Self::SchemaMismatch { raw, .. } => raw.clone(),
            Self::RetryableService { source, .. } | Self::NonRetryableService(source) => source
                .raw_body
                .as_deref()
                .map(|body| truncate_for_log(body, RAW_RESPONSE_LOG_LIMIT)),
            _ => None,
        }
    }

    /// Short diagnostic reason without raw bodies.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        match self {
            Self::GateRejection { reason, .. } => reason.clone(),
            Self::SchemaMismatch { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Converts to a dictionary representation for structured logs.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind().as_str()));
        map.insert("message".to_string(), serde_json::json!(self.diagnostic()));
        if let Some(raw) = self.raw_response() {
            map.insert("raw_response".to_string(), serde_json::json!(raw));
        }
        map
    }
}

/// Truncates `text` to at most `max_chars` characters, marking the cut.
#[must_use]
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_kind_retryability() {
        assert!(ServiceErrorKind::Timeout.is_retryable());
        assert!(ServiceErrorKind::Connection.is_retryable());
        assert!(ServiceErrorKind::Server.is_retryable());
        assert!(ServiceErrorKind::RateLimited.is_retryable());
        assert!(!ServiceErrorKind::Authentication.is_retryable());
        assert!(!ServiceErrorKind::MalformedRequest.is_retryable());
        assert!(!ServiceErrorKind::Validation.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ServiceErrorKind::from_status(200), None);
        assert_eq!(ServiceErrorKind::from_status(400), Some(ServiceErrorKind::MalformedRequest));
        assert_eq!(ServiceErrorKind::from_status(401), Some(ServiceErrorKind::Authentication));
        assert_eq!(ServiceErrorKind::from_status(403), Some(ServiceErrorKind::Authentication));
        assert_eq!(ServiceErrorKind::from_status(408), Some(ServiceErrorKind::Timeout));
        assert_eq!(ServiceErrorKind::from_status(429), Some(ServiceErrorKind::RateLimited));
        assert_eq!(ServiceErrorKind::from_status(503), Some(ServiceErrorKind::Server));
        assert_eq!(ServiceErrorKind::from_status(422), Some(ServiceErrorKind::Validation));
    }

    #[test]
    fn test_from_http_status_keeps_body_out_of_message() {
        let err = ServiceError::from_http_status(500, "{\"error\": \"stack trace here\"}");
        assert_eq!(err.kind, ServiceErrorKind::Server);
        assert_eq!(err.status, Some(500));
        assert!(!err.to_string().contains("stack trace"));
        assert!(err.raw_body.as_deref().unwrap().contains("stack trace"));
    }

    #[test]
    fn test_from_service_wraps_by_kind() {
        let retryable = PipelineError::from_service(ServiceError::timeout("slow"), 3);
        assert_eq!(retryable.kind(), ErrorKind::RetryableServiceError);

        let fatal = PipelineError::from_service(ServiceError::authentication("bad key"), 1);
        assert_eq!(fatal.kind(), ErrorKind::NonRetryableServiceError);
    }

    #[test]
    fn test_gate_rejection_is_not_a_fault() {
        let err = PipelineError::GateRejection {
            stage: StageName::Process,
            reason: "too unsure".to_string(),
        };
        assert!(!err.is_fault());
        assert_eq!(err.diagnostic(), "too unsure");
        assert!(PipelineError::cancelled("gone").is_cancelled());
        assert!(PipelineError::InvalidState("x".to_string()).is_fault());
    }

    #[test]
    fn test_schema_mismatch_truncates_raw() {
        let raw = "x".repeat(2000);
        let err = PipelineError::schema_mismatch(StageName::Analyze, "bad json", Some(&raw));
        let kept = err.raw_response().unwrap();
        assert!(kept.len() < 600);
        assert!(kept.ends_with("[truncated]"));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(ErrorKind::GateRejection.to_string(), "gate_rejection");
        let json = serde_json::to_string(&ErrorKind::TimeoutExceeded).unwrap();
        assert_eq!(json, r#""timeout_exceeded""#);
    }

    #[test]
    fn test_to_dict() {
        let err = PipelineError::NonRetryableService(
            ServiceError::malformed_request("bad field").with_raw_body("body"),
        );
        let dict = err.to_dict();
        assert_eq!(dict.get("kind").unwrap(), "non_retryable_service_error");
        assert_eq!(dict.get("raw_response").unwrap(), "body");
    }

    #[test]
    fn test_truncate_for_log_short_input() {
        assert_eq!(truncate_for_log("short", 10), "short");
    }
}
