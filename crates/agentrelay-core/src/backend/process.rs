//! Subprocess driver shared by both backends.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directives;
use crate::error::{Result, RunError};
use crate::models::{BackendKind, RunResult};

use super::accumulator::{LineBuffer, StreamAccumulator, accumulator_for};
use super::{AgentBackend, BackendOptions, claude, codex, partition_images};

/// Time a terminated process gets to exit before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8 * 1024;
const MAX_STDERR_BYTES: usize = 8 * 1024;
const LOG_PREVIEW_CHARS: usize = 200;

/// One agent CLI invocation.
pub struct BackendProcess {
    kind: BackendKind,
    binary: String,
    options: BackendOptions,
    text_tx: watch::Sender<String>,
    cancel: CancellationToken,
    pid: Mutex<Option<u32>>,
}

impl BackendProcess {
    pub fn new(kind: BackendKind, binary: impl Into<String>, options: BackendOptions) -> Self {
        let (text_tx, _) = watch::channel(String::new());
        Self {
            kind,
            binary: binary.into(),
            options,
            text_tx,
            cancel: CancellationToken::new(),
            pid: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Write the Codex instructions file, if this run needs one.
    fn prepare_instructions(&self) -> Result<Option<NamedTempFile>> {
        if self.kind != BackendKind::Codex {
            return Ok(None);
        }
        match self.options.system_prompt.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => Ok(Some(codex::write_instructions(prompt)?)),
            _ => Ok(None),
        }
    }

    fn build_command(&self, instructions: Option<&NamedTempFile>) -> Command {
        let args = match self.kind {
            BackendKind::Claude => claude::build_args(&self.options),
            BackendKind::Codex => {
                codex::build_args(&self.options, instructions.map(|file| file.path()))
            }
        };

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.options.working_dir.as_os_str().is_empty() {
            cmd.current_dir(&self.options.working_dir);
        }
        cmd
    }

    fn feed(&self, accumulator: &mut dyn StreamAccumulator, line: &str) {
        if let Err(e) = accumulator.apply_line(line) {
            warn!(
                backend = %self.kind,
                error = %e,
                line = %preview(line),
                "Dropping malformed protocol line"
            );
            return;
        }

        let text = &accumulator.state().text;
        if *self.text_tx.borrow() != *text {
            self.text_tx.send_replace(text.clone());
        }
    }

    /// Send a polite termination signal.
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = *self.pid.lock() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    info!(backend = %self.kind, pid, "Sent SIGTERM to agent process");
                    return;
                }
                Err(e) => warn!(pid, error = %e, "SIGTERM failed, killing agent process"),
            }
        }

        if let Err(e) = child.start_kill() {
            warn!(backend = %self.kind, error = %e, "Failed to kill agent process");
        }
    }

    async fn drive(&self, child: &mut Child) -> Result<(ExitStatus, Box<dyn StreamAccumulator>, bool)> {
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Io(std::io::Error::other("stdout was not captured")))?;

        let mut accumulator = accumulator_for(self.kind);
        let mut lines = LineBuffer::default();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut killed = false;
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !killed => {
                    killed = true;
                    self.terminate(child);
                    grace_deadline = Some(tokio::time::Instant::now() + KILL_GRACE);
                }
                _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() => {
                    warn!(backend = %self.kind, "Agent process ignored SIGTERM, killing");
                    grace_deadline = None;
                    let _ = child.start_kill();
                }
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for line in lines.push(&buf[..n]) {
                                self.feed(accumulator.as_mut(), &line);
                            }
                        }
                        Err(e) => {
                            warn!(backend = %self.kind, error = %e, "Error reading agent stdout");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(line) = lines.flush() {
            self.feed(accumulator.as_mut(), &line);
        }

        let status = child.wait().await?;
        Ok((status, accumulator, killed))
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                if collected.len() > MAX_STDERR_BYTES {
                    let excess = collected.len() - MAX_STDERR_BYTES;
                    collected.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&collected).trim().to_string()
}

fn preview(line: &str) -> String {
    if line.chars().count() <= LOG_PREVIEW_CHARS {
        return line.to_string();
    }
    let truncated: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
    format!("{truncated}...")
}

#[async_trait]
impl AgentBackend for BackendProcess {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn run(&self) -> Result<RunResult> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let started = Instant::now();
        // Held for the whole run; dropping it deletes the file on every path.
        let instructions = self.prepare_instructions()?;
        let mut cmd = self.build_command(instructions.as_ref());

        info!(
            backend = %self.kind,
            binary = %self.binary,
            working_dir = %self.options.working_dir.display(),
            continuation = self.options.continuation,
            plan_mode = self.options.plan_mode,
            "Starting agent process"
        );

        let mut child = cmd.spawn().map_err(|source| {
            error!(binary = %self.binary, error = %source, "Failed to spawn agent process");
            RunError::Spawn {
                binary: self.binary.clone(),
                source,
            }
        })?;
        *self.pid.lock() = child.id();

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_stderr(stderr)));

        let driven = self.drive(&mut child).await;
        *self.pid.lock() = None;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        drop(instructions);

        let (status, accumulator, killed) = driven?;
        let state = accumulator.into_state();
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = state
            .duration_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);

        if let Some(message) = state.error {
            warn!(backend = %self.kind, exit_code, error = %message, "Agent reported an error");
            return Ok(RunResult {
                display_text: message,
                duration_ms,
                cost_usd: state.cost_usd,
                is_error: true,
                session_id: state.session_id,
                usage: state.usage,
                ..Default::default()
            });
        }

        if !status.success() && state.text.trim().is_empty() {
            if killed {
                info!(backend = %self.kind, "Agent process killed before producing output");
                return Err(RunError::Cancelled);
            }
            error!(
                backend = %self.kind,
                exit_code,
                stderr = %preview(&stderr),
                "Agent process failed without output"
            );
            return Err(RunError::Infrastructure { exit_code, stderr });
        }

        let extracted = directives::extract(&state.text);
        let (created_files, image_files) = partition_images(state.created_files);

        debug!(
            backend = %self.kind,
            exit_code,
            duration_ms,
            text_len = extracted.text.len(),
            files = created_files.len(),
            images = image_files.len(),
            uploads = extracted.uploads.len(),
            callbacks = extracted.callbacks.len(),
            "Agent process finished"
        );

        Ok(RunResult {
            display_text: extracted.text,
            duration_ms,
            cost_usd: state.cost_usd,
            is_error: false,
            session_id: state.session_id,
            created_files,
            image_files,
            upload_files: extracted.uploads,
            callbacks: extracted.callbacks,
            usage: state.usage,
        })
    }

    fn current_text(&self) -> String {
        self.text_tx.borrow().clone()
    }

    fn kill(&self) {
        self.cancel.cancel();
    }

    fn subscribe(&self) -> watch::Receiver<String> {
        self.text_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_long_lines() {
        let line = "x".repeat(500);
        let short = preview(&line);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), LOG_PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let process = BackendProcess::new(
            BackendKind::Claude,
            "/nonexistent/agentrelay-test-binary",
            BackendOptions::default(),
        );
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_kill_before_run_cancels() {
        let process = BackendProcess::new(BackendKind::Codex, "codex", BackendOptions::default());
        process.kill();
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_without_output_is_infrastructure_failure() {
        let process = BackendProcess::new(BackendKind::Claude, "false", BackendOptions::default());
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, RunError::Infrastructure { exit_code: 1, .. }));
    }
}
