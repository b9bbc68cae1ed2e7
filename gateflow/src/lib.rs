//! # Gateflow
//!
//! A sequential validation pipeline for generative-text services.
//!
//! Every request runs through three stages in a fixed order:
//!
//! - **Analyze**: extracts intent, key entities and complexity as structured data
//! - **Process**: drafts the answer with a confidence score
//! - **Synthesize**: streams the final user-facing text token by token
//!
//! Each stage's output passes a validation gate before it is merged into the
//! accumulated state. A rejection or an unrecoverable failure routes the run
//! to an error stage that always produces a safe, deterministic response.
//! Service calls go through a gateway with bounded retries and a circuit
//! breaker shared by all runs.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use gateflow::prelude::*;
//!
//! let pipeline = Pipeline::builder()
//!     .with_service(Arc::new(GeminiService::new(GeminiConfig::from_env()?)?))
//!     .with_config(PipelineConfig::from_file("gateflow.json")?.with_env_overrides()?)
//!     .build()?;
//!
//! let mut run = pipeline.run(RunRequest::new("user-42", "How do tides work?"));
//! while let Some(event) = run.next().await {
//!     match event {
//!         PipelineEvent::Token(text) => print!("{text}"),
//!         PipelineEvent::Completed(outcome) => println!("\n[{}]", outcome.summary.total_cost_usd),
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod gates;
pub mod gateway;
pub mod metrics;
pub mod pipeline;
pub mod relay;
pub mod service;
pub mod stages;
pub mod state;
pub mod telemetry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{PipelineConfig, StageConfig};
    pub use crate::errors::{ErrorKind, PipelineError, ServiceError, ServiceErrorKind};
    pub use crate::gates::{Gate, GateDecision};
    pub use crate::gateway::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
    pub use crate::metrics::{
        CollectingMetricsSink, MetricsSink, NoOpMetricsSink, RunSummary, StageMetrics,
        TracingMetricsSink,
    };
    pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineRun, RunOutcome, RunRequest};
    pub use crate::relay::PipelineEvent;
    pub use crate::service::{GenerativeService, ServiceRequest, ServiceResponse, Usage};
    #[cfg(feature = "gemini")]
    pub use crate::service::gemini::{GeminiConfig, GeminiService};
    pub use crate::state::{Message, StageName, TextFormat};
    pub use crate::telemetry::{init_tracing, LogFormat};
    pub use std::sync::Arc;
}
