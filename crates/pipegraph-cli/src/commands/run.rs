//! Local build type execution command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pipegraph_core::BuildTypeId;
use pipegraph_core::executor::LogStream;
use pipegraph_executor::ProcessExecutor;
use pipegraph_scheduler::{CommandCatalog, DispatchEvent, StepDispatcher, StepState};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{GlobalOptions, load, resolve_validated};

/// Run a build type locally as child processes.
pub async fn run_local(
    options: &GlobalOptions,
    dir: &Path,
    build_type: &str,
    working_dir: Option<PathBuf>,
) -> Result<()> {
    let (registry, system) = load(options, dir)?;
    let project = resolve_validated(&registry, &system)?;

    let build_type = BuildTypeId::new(build_type)?;
    let build = project
        .find_build_type(&build_type)
        .with_context(|| format!("Unknown build type: {}", build_type))?;

    println!("Running build type: {}", build.name);
    println!("Steps: {}", build.steps.len());

    let working_dir = match working_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    }
    .canonicalize()
    .context("Failed to resolve working directory")?;
    println!("Working directory: {}", working_dir.display());

    let mut executor = ProcessExecutor::new();
    if let Some(log_dir) = &system.log_dir {
        executor = executor.with_log_dir(log_dir);
    }

    let mut env = HashMap::new();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("PIPEGRAPH".to_string(), "true".to_string());

    let dispatcher = StepDispatcher::new(CommandCatalog::from_system(&system))
        .with_executor(Arc::new(executor))
        .with_working_dir(working_dir)
        .with_env(env);

    // Ctrl-C cancels the running step and everything after it
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            on_signal.cancel();
        }
    });

    println!("\n--- Starting build ---\n");

    let (mut rx, result_handle) = dispatcher.execute(&project, &build_type, cancel)?;

    while let Some(event) = rx.recv().await {
        match event {
            DispatchEvent::StepStarted { step, command, .. } => {
                println!("▶ Step '{}' started: {}", step, command.join(" "));
            }
            DispatchEvent::StepLog { step, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", step, stream_marker, line.content);
            }
            DispatchEvent::StepCompleted {
                step,
                exit_code,
                success,
            } => {
                if success {
                    println!("✓ Step '{}' completed successfully\n", step);
                } else {
                    match exit_code {
                        Some(code) => println!("✗ Step '{}' failed with exit code {}\n", step, code),
                        None => println!("✗ Step '{}' did not complete\n", step),
                    }
                }
            }
            DispatchEvent::StepSkipped { step, reason } => {
                println!("⊘ Step '{}' skipped: {}\n", step, reason);
            }
            DispatchEvent::BuildCompleted { success } => {
                if success {
                    println!("--- Build completed successfully ---");
                } else {
                    println!("--- Build failed ---");
                }
            }
        }
    }

    let result = result_handle.await.context("Build execution task failed")?;

    println!("\n--- Step Summary ---");
    for (step, state) in &result.step_states {
        let status = match state {
            StepState::Succeeded => "✓ succeeded".to_string(),
            StepState::Failed { message, .. } => format!("✗ failed: {}", message),
            StepState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StepState::Cancelled => "■ cancelled".to_string(),
            StepState::Pending => "○ pending".to_string(),
        };
        println!("  {} - {}", step, status);
        if let Some(log) = result
            .outcomes
            .get(step)
            .and_then(|o| o.stdout_ref.as_ref())
        {
            println!("      log: {}", log);
        }
    }

    if result.success {
        println!("\n✓ Build succeeded!");
        Ok(())
    } else {
        anyhow::bail!("Build failed");
    }
}
