//! Step dispatcher - runs the steps of a resolved build type in order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pipegraph_config::ValidatedProject;
use pipegraph_core::executor::{LogLine, StepExecutor, StepInvocation, StepOutcome};
use pipegraph_core::model::Step;
use pipegraph_core::resolved::ResolvedBuildType;
use pipegraph_core::{BuildTypeId, Error, InvocationId, Result, StepId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::{CommandCatalog, WORKING_DIR_KEY};

/// Build parameters with this prefix become environment variables.
const ENV_PREFIX: &str = "env.";

/// State of a step during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    Skipped {
        reason: String,
    },
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepState::Succeeded)
    }
}

/// Event emitted during dispatch.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    StepStarted {
        step: StepId,
        invocation: InvocationId,
        command: Vec<String>,
    },
    StepLog {
        step: StepId,
        line: LogLine,
    },
    StepCompleted {
        step: StepId,
        exit_code: Option<i32>,
        success: bool,
    },
    StepSkipped {
        step: StepId,
        reason: String,
    },
    BuildCompleted {
        success: bool,
    },
}

/// Result of dispatching a build type.
#[derive(Debug)]
pub struct DispatchResult {
    pub success: bool,
    /// Final state of every step, in declaration order.
    pub step_states: Vec<(StepId, StepState)>,
    pub outcomes: HashMap<StepId, StepOutcome>,
}

impl DispatchResult {
    pub fn state(&self, step: &StepId) -> Option<&StepState> {
        self.step_states
            .iter()
            .find(|(id, _)| id == step)
            .map(|(_, state)| state)
    }
}

/// Runs resolved steps through executors.
pub struct StepDispatcher {
    executors: Vec<Arc<dyn StepExecutor>>,
    catalog: Arc<CommandCatalog>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
}

impl StepDispatcher {
    pub fn new(catalog: CommandCatalog) -> Self {
        Self {
            executors: Vec::new(),
            catalog: Arc::new(catalog),
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
        }
    }

    /// Register an executor. The first registered executor that supports a
    /// step's kind runs it.
    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Base directory that `working-dir` step settings are relative to.
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Extra environment for every step.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Execute a build type, returning a channel of events and a handle to get the final result.
    pub fn execute(
        &self,
        project: &ValidatedProject,
        build_type: &BuildTypeId,
        cancel: CancellationToken,
    ) -> Result<(
        mpsc::Receiver<DispatchEvent>,
        tokio::task::JoinHandle<DispatchResult>,
    )> {
        let build = project
            .find_build_type(build_type)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("unknown build type '{build_type}'")))?;

        let (tx, rx) = mpsc::channel(100);
        let run = Run {
            executors: self.executors.clone(),
            catalog: self.catalog.clone(),
            working_dir: self.working_dir.clone(),
            env: self.build_env(&build),
            build,
            cancel,
            tx,
        };

        let handle = tokio::spawn(run.execute());
        Ok((rx, handle))
    }

    fn build_env(&self, build: &ResolvedBuildType) -> HashMap<String, String> {
        let mut env = self.env.clone();
        for (key, value) in build.params.iter() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                env.insert(name.to_string(), value.to_string());
            }
        }
        env
    }
}

/// One dispatch of one build type.
struct Run {
    executors: Vec<Arc<dyn StepExecutor>>,
    catalog: Arc<CommandCatalog>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    build: ResolvedBuildType,
    cancel: CancellationToken,
    tx: mpsc::Sender<DispatchEvent>,
}

impl Run {
    async fn execute(self) -> DispatchResult {
        let mut step_states: Vec<(StepId, StepState)> = self
            .build
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::Pending))
            .collect();
        let mut outcomes = HashMap::new();
        let mut failed = false;
        let mut cancelled = false;

        info!(build_type = %self.build.id, steps = self.build.steps.len(), "Dispatching build");

        for (index, step) in self.build.steps.iter().enumerate() {
            let skip = if !step.enabled {
                Some(("step is disabled", false))
            } else if self.cancel.is_cancelled() {
                Some(("build was cancelled", true))
            } else if failed {
                Some(("a previous step failed", false))
            } else {
                None
            };

            if let Some((reason, by_cancel)) = skip {
                info!(step = %step.id, reason, "Skipping step");
                cancelled |= by_cancel;
                step_states[index].1 = if by_cancel {
                    StepState::Cancelled
                } else {
                    StepState::Skipped {
                        reason: reason.to_string(),
                    }
                };
                let _ = self
                    .tx
                    .send(DispatchEvent::StepSkipped {
                        step: step.id.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
                continue;
            }

            let state = match self.run_step(step).await {
                Ok(outcome) => {
                    let state = if outcome.succeeded() {
                        info!(step = %step.id, "Step completed successfully");
                        StepState::Succeeded
                    } else {
                        error!(step = %step.id, exit_code = outcome.exit_code, "Step failed");
                        StepState::Failed {
                            exit_code: Some(outcome.exit_code),
                            message: format!("exited with code {}", outcome.exit_code),
                        }
                    };
                    outcomes.insert(step.id.clone(), outcome);
                    state
                }
                Err(Error::Cancelled) => {
                    warn!(step = %step.id, "Step cancelled");
                    StepState::Cancelled
                }
                Err(e) => {
                    error!(step = %step.id, error = %e, "Step failed");
                    StepState::Failed {
                        exit_code: None,
                        message: e.to_string(),
                    }
                }
            };

            let exit_code = match &state {
                StepState::Failed { exit_code, .. } => *exit_code,
                StepState::Succeeded => Some(0),
                _ => None,
            };
            failed |= matches!(state, StepState::Failed { .. });
            cancelled |= matches!(state, StepState::Cancelled);

            let _ = self
                .tx
                .send(DispatchEvent::StepCompleted {
                    step: step.id.clone(),
                    exit_code,
                    success: state.is_success(),
                })
                .await;
            step_states[index].1 = state;
        }

        let success = !failed && !cancelled;
        info!(build_type = %self.build.id, success, "Build finished");
        let _ = self.tx.send(DispatchEvent::BuildCompleted { success }).await;

        DispatchResult {
            success,
            step_states,
            outcomes,
        }
    }

    /// Execute a single step.
    async fn run_step(&self, step: &Step) -> Result<StepOutcome> {
        let command = self.catalog.command_in(step, &self.build.params)?;
        let executor = self
            .executors
            .iter()
            .find(|e| e.supports(&step.kind))
            .ok_or_else(|| {
                Error::ExecutionFailed(format!("no executor for step kind '{}'", step.kind))
            })?;

        let working_dir = match step.config.get(WORKING_DIR_KEY) {
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        };

        let invocation = StepInvocation {
            id: InvocationId::new(),
            build_type: self.build.id.clone(),
            step: step.id.clone(),
            kind: step.kind.clone(),
            config: step.config.clone(),
            command: command.clone(),
            env: self.env.clone(),
            working_dir,
        };

        info!(
            step = %step.id,
            executor = executor.name(),
            invocation = %invocation.id,
            "Starting step"
        );
        let _ = self
            .tx
            .send(DispatchEvent::StepStarted {
                step: step.id.clone(),
                invocation: invocation.id,
                command,
            })
            .await;

        // Forward executor log lines as events
        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(100);
        let step_id = step.id.clone();
        let tx = self.tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = tx
                    .send(DispatchEvent::StepLog {
                        step: step_id.clone(),
                        line,
                    })
                    .await;
            }
        });

        let result = executor
            .execute(invocation, log_tx, self.cancel.child_token())
            .await;
        let _ = forward.await;
        result
    }
}
