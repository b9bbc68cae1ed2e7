//! Testing utilities for gateflow pipelines.
//!
//! This module provides:
//! - A scripted generative service with call accounting
//! - A harness for running one stage executor in isolation
//! - Fixtures and assertions for run outcomes

mod assertions;
pub mod fixtures;
mod harness;
mod mocks;

pub use assertions::{
    assert_metrics_stages, assert_routed_to_error, assert_succeeded, assert_token_sequence,
};
pub use harness::StageHarness;
pub use mocks::{ScriptedService, ScriptedStream};
