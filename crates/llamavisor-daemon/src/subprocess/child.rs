//! One running instance of the inference executable.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use llamavisor_core::config::ChildSettings;

/// Launch parameters for the inference executable.
#[derive(Debug, Clone)]
pub struct ChildConfig {
    pub executable: PathBuf,
    pub model_path: PathBuf,
    pub threads: u32,
    pub context_size: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Passed as the reverse prompt so the child stops and waits after each turn.
    pub sentinel: String,
    pub extra_args: Vec<String>,
}

impl ChildConfig {
    pub fn from_settings(settings: &ChildSettings) -> Self {
        Self {
            executable: settings.executable.clone(),
            model_path: settings.model_path.clone(),
            threads: settings.threads,
            context_size: settings.context_size,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            sentinel: settings.sentinel.clone(),
            extra_args: settings.extra_args.clone(),
        }
    }

    /// Argument vector passed to the executable.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.to_string_lossy().into_owned(),
            "--threads".to_string(),
            self.threads.to_string(),
            "--ctx-size".to_string(),
            self.context_size.to_string(),
            "--temp".to_string(),
            self.temperature.to_string(),
            "--n-predict".to_string(),
            self.max_tokens.to_string(),
            "--reverse-prompt".to_string(),
            self.sentinel.clone(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Errors from starting the child.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Inference executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },

    #[error("Model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("Failed to spawn child process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Child {stream} was not captured")]
    PipeUnavailable { stream: &'static str },
}

/// Exclusive owner of one OS process and its standard streams.
///
/// The process is killed if the handle is dropped while it is still running.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    pid: Option<u32>,
    generation: u64,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<ExitStatus>,
}

impl ChildHandle {
    /// Validate the launch files and start the process with piped streams.
    pub fn spawn(config: &ChildConfig, generation: u64) -> Result<Self, SpawnError> {
        if is_explicit_path(&config.executable) && !config.executable.exists() {
            return Err(SpawnError::ExecutableNotFound {
                path: config.executable.clone(),
            });
        }
        if !config.model_path.exists() {
            return Err(SpawnError::ModelNotFound {
                path: config.model_path.clone(),
            });
        }

        let mut cmd = Command::new(&config.executable);
        cmd.args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpawnError::ExecutableNotFound {
                    path: config.executable.clone(),
                }
            } else {
                SpawnError::SpawnFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        let pid = child.id();
        info!(
            generation,
            pid,
            executable = %config.executable.display(),
            model = %config.model_path.display(),
            "Child process spawned"
        );

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            generation,
            exit: None,
        })
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, SpawnError> {
        self.stdin
            .take()
            .ok_or(SpawnError::PipeUnavailable { stream: "stdin" })
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, SpawnError> {
        self.stdout
            .take()
            .ok_or(SpawnError::PipeUnavailable { stream: "stdout" })
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Whether the process has not been observed to exit.
    pub const fn is_alive(&self) -> bool {
        self.exit.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// Non-blocking exit check. Returns the exit status once the process is gone.
    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(status),
                Ok(None) => {}
                Err(e) => warn!(generation = self.generation, error = %e, "try_wait failed"),
            }
        }
        self.exit
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.wait().await {
                Ok(status) => self.exit = Some(status),
                Err(e) => warn!(generation = self.generation, error = %e, "wait failed"),
            }
        }
        self.exit
    }

    /// Ask the process to stop, then kill it if it has not exited within `timeout`.
    pub async fn terminate(&mut self, timeout: Duration) {
        if self.try_exit().is_some() {
            return;
        }
        // Closing stdin lets interactive children notice end of input.
        self.stdin.take();

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: pid is a valid process ID obtained from our own Child handle,
                // which has not been reaped yet. kill(2) with SIGTERM is safe to call
                // on any owned subprocess.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(generation = self.generation, pid, error = %err, "Failed to send SIGTERM");
                }
            }
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(generation = self.generation, ?status, "Child exited gracefully");
                self.exit = Some(status);
            }
            Ok(Err(e)) => {
                warn!(generation = self.generation, error = %e, "Error waiting for child, killing");
                self.force_kill().await;
            }
            Err(_) => {
                warn!(generation = self.generation, "Timeout waiting for graceful exit, killing");
                self.force_kill().await;
            }
        }
    }

    async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(generation = self.generation, error = %e, "Failed to kill child");
        }
        self.wait().await;
    }
}

fn is_explicit_path(path: &Path) -> bool {
    path.is_absolute() || path.components().count() > 1
}
