//! Step execution backends for pipegraph.
//!
//! Provides executor implementations for running resolved steps:
//! - Local child processes

pub mod process;

pub use pipegraph_core::executor::{
    ArtifactRef, LogLine, LogSink, LogStream, StepExecutor, StepInvocation, StepOutcome,
};
pub use process::ProcessExecutor;
