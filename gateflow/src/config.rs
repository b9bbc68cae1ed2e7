//! Pipeline configuration.
//!
//! Configuration can be built in code with the `with_*` builders, loaded from
//! JSON, and then overridden from `GATEFLOW_*` environment variables. Every
//! field has a default, so an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::gateway::{CircuitBreakerConfig, RetryConfig};
use crate::metrics::CostModel;
use crate::state::StageName;

/// Default model for every stage.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const ENV_PREFIX: &str = "GATEFLOW_";

/// Generation settings and time budget of one service-backed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Model name passed to the service.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens.
    pub max_output_tokens: u32,
    /// Wall-clock budget for the whole stage, retries included.
    pub timeout_seconds: f64,
}

impl StageConfig {
    /// Creates a stage configuration.
    #[must_use]
    pub fn new(temperature: f64, max_output_tokens: u32, timeout_seconds: f64) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature,
            max_output_tokens,
            timeout_seconds,
        }
    }

    /// Default settings for a stage.
    #[must_use]
    pub fn default_for(stage: StageName) -> Self {
        match stage {
            StageName::Analyze => Self::new(0.2, 1024, 30.0),
            StageName::Process => Self::new(0.4, 2048, 45.0),
            StageName::Synthesize | StageName::Error => Self::new(0.7, 4096, 60.0),
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the maximum output tokens.
    #[must_use]
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Gets the timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }

    fn validate(&self, stage: StageName) -> Result<(), PipelineError> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::Config(format!("{stage}.model must not be empty")));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::Config(format!(
                "{stage}.temperature must be within [0.0, 2.0], got {}",
                self.temperature
            )));
        }
        if self.max_output_tokens == 0 {
            return Err(PipelineError::Config(format!(
                "{stage}.max_output_tokens must be at least 1"
            )));
        }
        if self.timeout_seconds <= 0.0 || Duration::try_from_secs_f64(self.timeout_seconds).is_err() {
            return Err(PipelineError::Config(format!(
                "{stage}.timeout_seconds must be a positive duration in range, got {}",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PipelineConfigFile")]
pub struct PipelineConfig {
    /// Analyze stage settings.
    pub analyze: StageConfig,
    /// Process stage settings.
    pub process: StageConfig,
    /// Synthesize stage settings.
    pub synthesize: StageConfig,
    /// Minimum Process confidence accepted by the gate (inclusive).
    pub min_confidence: f64,
    /// Breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Capacity of the token relay channel.
    pub relay_buffer: usize,
    /// Per-model price table.
    pub pricing: CostModel,
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_relay_buffer() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyze: StageConfig::default_for(StageName::Analyze),
            process: StageConfig::default_for(StageName::Process),
            synthesize: StageConfig::default_for(StageName::Synthesize),
            min_confidence: default_min_confidence(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            relay_buffer: default_relay_buffer(),
            pricing: CostModel::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("invalid configuration JSON: {e}")))
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    /// Applies `GATEFLOW_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, PipelineError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `GATEFLOW_*` overrides read through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("MIN_CONFIDENCE") {
            self.min_confidence = parse_env("MIN_CONFIDENCE", &value)?;
        }
        if let Some(value) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = var("CB_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = parse_env("CB_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = var("CB_RECOVERY_TIMEOUT_SECONDS") {
            self.circuit_breaker.recovery_timeout_seconds =
                parse_env("CB_RECOVERY_TIMEOUT_SECONDS", &value)?;
        }

        for stage in [StageName::Analyze, StageName::Process, StageName::Synthesize] {
            let upper = stage.as_str().to_ascii_uppercase();
            let model_key = format!("{upper}_MODEL");
            let timeout_key = format!("{upper}_TIMEOUT_SECONDS");
            let model = var(&model_key);
            let timeout = var(&timeout_key)
                .map(|value| parse_env::<f64>(&timeout_key, &value))
                .transpose()?;

            if let Some(config) = self.stage_config_mut(stage) {
                if let Some(model) = model {
                    config.model = model;
                }
                if let Some(timeout) = timeout {
                    config.timeout_seconds = timeout;
                }
            }
        }

        Ok(self)
    }

    /// Returns the settings of a service-backed stage.
    #[must_use]
    pub fn stage_config(&self, stage: StageName) -> Option<&StageConfig> {
        match stage {
            StageName::Analyze => Some(&self.analyze),
            StageName::Process => Some(&self.process),
            StageName::Synthesize => Some(&self.synthesize),
            StageName::Error => None,
        }
    }

    fn stage_config_mut(&mut self, stage: StageName) -> Option<&mut StageConfig> {
        match stage {
            StageName::Analyze => Some(&mut self.analyze),
            StageName::Process => Some(&mut self.process),
            StageName::Synthesize => Some(&mut self.synthesize),
            StageName::Error => None,
        }
    }

    /// Replaces the settings of a service-backed stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageName, config: StageConfig) -> Self {
        if let Some(slot) = self.stage_config_mut(stage) {
            *slot = config;
        }
        self
    }

    /// Sets the minimum accepted confidence.
    #[must_use]
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the breaker thresholds.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Sets the relay channel capacity.
    #[must_use]
    pub fn with_relay_buffer(mut self, relay_buffer: usize) -> Self {
        self.relay_buffer = relay_buffer;
        self
    }

    /// Sets the price table.
    #[must_use]
    pub fn with_pricing(mut self, pricing: CostModel) -> Self {
        self.pricing = pricing;
        self
    }

    /// Upper bound on a run's duration: every stage timeout plus the error
    /// stage's negligible work.
    #[must_use]
    pub fn max_run_duration(&self) -> Duration {
        self.analyze
            .timeout()
            .saturating_add(self.process.timeout())
            .saturating_add(self.synthesize.timeout())
    }

    /// Checks every value is within range.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.min_confidence.is_finite() || !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(PipelineError::Config(format!(
                "min_confidence must be within [0.0, 1.0], got {}",
                self.min_confidence
            )));
        }
        if self.relay_buffer == 0 {
            return Err(PipelineError::Config(
                "relay_buffer must be at least 1".to_string(),
            ));
        }
        self.analyze.validate(StageName::Analyze)?;
        self.process.validate(StageName::Process)?;
        self.synthesize.validate(StageName::Synthesize)?;
        self.retry.validate()?;
        self.circuit_breaker.validate()
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        PipelineError::Config(format!("{ENV_PREFIX}{name}={value:?} is invalid: {e}"))
    })
}

/// Per-stage settings as written in a file; unset fields keep the stage's
/// own defaults.
#[derive(Debug, Default, Deserialize)]
struct StageConfigFile {
    model: Option<String>,
    temperature: Option<f64>,
    max_output_tokens: Option<u32>,
    timeout_seconds: Option<f64>,
}

impl StageConfigFile {
    fn resolve(self, stage: StageName) -> StageConfig {
        let defaults = StageConfig::default_for(stage);
        StageConfig {
            model: self.model.unwrap_or(defaults.model),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            timeout_seconds: self.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipelineConfigFile {
    #[serde(default)]
    analyze: StageConfigFile,
    #[serde(default)]
    process: StageConfigFile,
    #[serde(default)]
    synthesize: StageConfigFile,
    #[serde(default = "default_min_confidence")]
    min_confidence: f64,
    #[serde(default)]
    circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default = "default_relay_buffer")]
    relay_buffer: usize,
    #[serde(default)]
    pricing: CostModel,
}

impl From<PipelineConfigFile> for PipelineConfig {
    fn from(file: PipelineConfigFile) -> Self {
        Self {
            analyze: file.analyze.resolve(StageName::Analyze),
            process: file.process.resolve(StageName::Process),
            synthesize: file.synthesize.resolve(StageName::Synthesize),
            min_confidence: file.min_confidence,
            circuit_breaker: file.circuit_breaker,
            retry: file.retry,
            relay_buffer: file.relay_buffer,
            pricing: file.pricing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.min_confidence, 0.5);
        assert_eq!(config.relay_buffer, 64);
        assert_eq!(config.analyze.timeout(), Duration::from_secs(30));
        assert_eq!(config.synthesize.max_output_tokens, 4096);
        assert_eq!(config.process.model, DEFAULT_MODEL);
        assert!(config.validate().is_ok());
        assert!(config.stage_config(StageName::Error).is_none());
    }

    #[test]
    fn test_empty_json_equals_defaults() {
        assert_eq!(PipelineConfig::from_json_str("{}").unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_partial_stage_keeps_stage_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{"process": {"model": "gemini-1.5-pro"}, "min_confidence": 0.7}"#,
        )
        .unwrap();
        assert_eq!(config.process.model, "gemini-1.5-pro");
        assert_eq!(config.process.max_output_tokens, 2048);
        assert_eq!(config.process.timeout_seconds, 45.0);
        assert_eq!(config.min_confidence, 0.7);
    }

    #[test]
    fn test_serialized_config_reloads() {
        let config = PipelineConfig::default().with_min_confidence(0.8);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(PipelineConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = PipelineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"retry": {{"max_attempts": 4}}, "relay_buffer": 8}}"#).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.relay_buffer, 8);

        assert!(PipelineConfig::from_file("/definitely/not/here.json").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GATEFLOW_MIN_CONFIDENCE", "0.65"),
            ("GATEFLOW_RETRY_MAX_ATTEMPTS", "5"),
            ("GATEFLOW_RETRY_BASE_DELAY_MS", "250"),
            ("GATEFLOW_CB_FAILURE_THRESHOLD", "2"),
            ("GATEFLOW_CB_RECOVERY_TIMEOUT_SECONDS", "12.5"),
            ("GATEFLOW_SYNTHESIZE_MODEL", "gemini-1.5-pro"),
            ("GATEFLOW_ANALYZE_TIMEOUT_SECONDS", "5"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::default()
            .with_overrides_from(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.min_confidence, 0.65);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout_seconds, 12.5);
        assert_eq!(config.synthesize.model, "gemini-1.5-pro");
        assert_eq!(config.analyze.timeout(), Duration::from_secs(5));
        assert_eq!(config.process.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_bad_env_override() {
        let err = PipelineConfig::default()
            .with_overrides_from(|key| (key == "GATEFLOW_RETRY_MAX_ATTEMPTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GATEFLOW_RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_validate_ranges() {
        assert!(PipelineConfig::default().with_min_confidence(1.5).validate().is_err());
        assert!(PipelineConfig::default().with_min_confidence(f64::NAN).validate().is_err());
        assert!(PipelineConfig::default().with_relay_buffer(0).validate().is_err());

        let zero_timeout = StageConfig::default_for(StageName::Process).with_timeout(Duration::ZERO);
        let err = PipelineConfig::default()
            .with_stage(StageName::Process, zero_timeout)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("process.timeout_seconds"));
    }

    #[test]
    fn test_oversized_timeouts_are_rejected() {
        let mut config = PipelineConfig::default();
        config.analyze.timeout_seconds = 1e30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("analyze.timeout_seconds"));
        assert_eq!(config.analyze.timeout(), Duration::MAX);
        assert_eq!(config.max_run_duration(), Duration::MAX);

        let err = PipelineConfig::default()
            .with_overrides_from(|key| {
                (key == "GATEFLOW_CB_RECOVERY_TIMEOUT_SECONDS").then(|| "1e30".to_string())
            })
            .and_then(|config| config.validate())
            .unwrap_err();
        assert!(err.to_string().contains("recovery_timeout_seconds"));
    }

    #[test]
    fn test_max_run_duration() {
        assert_eq!(PipelineConfig::default().max_run_duration(), Duration::from_secs(135));
    }
}
