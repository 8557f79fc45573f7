//! Local process executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use pipegraph_core::executor::*;
use pipegraph_core::model::StepKind;
use pipegraph_core::{Error, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Step config key listing artifact paths, relative to the working directory.
pub const ARTIFACTS_KEY: &str = "artifacts";

/// Runs each step as a child process on the local machine.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    log_dir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep each step's stdout in `<dir>/<invocation id>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    async fn open_log(&self, invocation: &StepInvocation) -> Result<Option<(PathBuf, File)>> {
        let Some(dir) = &self.log_dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.log", invocation.id));
        let file = File::create(&path).await?;
        Ok(Some((path, file)))
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    fn supports(&self, kind: &StepKind) -> bool {
        kind.is_supported()
    }

    async fn execute(
        &self,
        invocation: StepInvocation,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        let (program, args) = invocation.command.split_first().ok_or_else(|| {
            Error::InvalidInput(format!("step '{}' has an empty command", invocation.step))
        })?;

        info!(
            invocation = %invocation.id,
            step = %invocation.step,
            program = %program,
            working_dir = %invocation.working_dir.display(),
            "Starting step process"
        );

        let log = self.open_log(&invocation).await?;
        let (stdout_ref, log_file) = match log {
            Some((path, file)) => (Some(path.display().to_string()), Some(file)),
            None => (None, None),
        };

        let started_at = Utc::now();
        let mut child = Command::new(program)
            .args(args)
            .envs(&invocation.env)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to start {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let mut readers = [
            tokio::spawn(pump(stdout, LogStream::Stdout, logs.clone(), log_file)),
            tokio::spawn(pump(stderr, LogStream::Stderr, logs.clone(), None)),
        ];

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            warn!(invocation = %invocation.id, step = %invocation.step, "Killing cancelled step");
            child.kill().await?;
            abort_readers(&readers);
            notify_cancelled(&logs).await;
            return Err(Error::Cancelled);
        };

        // Background processes can keep the pipes open after the child exits.
        let drained = tokio::select! {
            _ = await_readers(&mut readers) => true,
            _ = cancel.cancelled() => false,
        };
        if !drained {
            warn!(invocation = %invocation.id, step = %invocation.step, "Cancelled while reading step output");
            abort_readers(&readers);
            notify_cancelled(&logs).await;
            return Err(Error::Cancelled);
        }

        let finished_at = Utc::now();
        // Processes killed by a signal have no exit code.
        let exit_code = status.code().unwrap_or(-1);
        let artifact_refs = collect_artifacts(&invocation).await;

        info!(
            invocation = %invocation.id,
            step = %invocation.step,
            exit_code,
            artifacts = artifact_refs.len(),
            "Step process finished"
        );

        Ok(StepOutcome {
            exit_code,
            stdout_ref,
            artifact_refs,
            started_at,
            finished_at,
        })
    }
}

async fn await_readers(readers: &mut [JoinHandle<std::io::Result<()>>]) {
    for reader in readers.iter_mut() {
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to read step output"),
            Err(e) => warn!(error = %e, "Output reader panicked"),
        }
    }
}

fn abort_readers(readers: &[JoinHandle<std::io::Result<()>>]) {
    for reader in readers {
        reader.abort();
    }
}

async fn notify_cancelled(logs: &LogSink) {
    let _ = logs
        .send(LogLine {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: "Step cancelled".to_string(),
        })
        .await;
}

/// Forward lines from `reader` to `sink`, copying them to `file` if given.
async fn pump<R>(
    reader: R,
    stream: LogStream,
    sink: LogSink,
    mut file: Option<File>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(file) = file.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        // Keep draining after the receiver is gone so the child never blocks.
        let _ = sink
            .send(LogLine {
                timestamp: Utc::now(),
                stream,
                content: line,
            })
            .await;
    }
    if let Some(file) = file.as_mut() {
        file.flush().await?;
    }
    Ok(())
}

/// Artifacts listed under `artifacts` that exist after the step ran.
async fn collect_artifacts(invocation: &StepInvocation) -> Vec<ArtifactRef> {
    let Some(paths) = invocation.config.get(ARTIFACTS_KEY) else {
        return Vec::new();
    };

    let mut refs = Vec::new();
    for entry in artifact_paths(paths) {
        let path = invocation.working_dir.join(entry);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => refs.push(ArtifactRef {
                name: file_name(&path),
                path: path.display().to_string(),
                size: meta.len(),
            }),
            _ => debug!(path = %path.display(), "Artifact not found"),
        }
    }
    refs
}

fn artifact_paths(paths: &str) -> impl Iterator<Item = &str> {
    paths
        .split([',', '\n'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
