//! Executor boundary.
//!
//! Each resolved step is dispatched to an external executor chosen by the
//! step's kind. The executor receives the substituted step configuration and
//! working directory and reports an exit code plus references to its output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::id::{BuildTypeId, InvocationId, StepId};
use crate::model::StepKind;

/// One step handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocation {
    /// Unique identifier for this invocation.
    pub id: InvocationId,
    /// Build type the step belongs to.
    pub build_type: BuildTypeId,
    /// Step being executed.
    pub step: StepId,
    pub kind: StepKind,
    /// Fully substituted step configuration.
    pub config: BTreeMap<String, String>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Working directory for the process.
    pub working_dir: PathBuf,
}

/// What an executor reports for a finished step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub exit_code: i32,
    /// Where the captured stdout can be found, if it was kept.
    pub stdout_ref: Option<String>,
    /// Artifacts produced by the step.
    pub artifact_refs: Vec<ArtifactRef>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Reference to an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Channel an executor streams log lines into.
pub type LogSink = mpsc::Sender<LogLine>;

/// Trait for step executors.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor handles steps of the given kind.
    fn supports(&self, kind: &StepKind) -> bool;

    /// Run one step to completion.
    ///
    /// Implementations stop the step and return [`Error::Cancelled`](crate::Error::Cancelled)
    /// once `cancel` fires. They never retry.
    async fn execute(
        &self,
        invocation: StepInvocation,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<StepOutcome>;
}
