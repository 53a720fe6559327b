//! Child lifecycle: start, detect death, restart with a bounded budget, stop.
//!
//! ```text
//! Stopped → Starting → Ready ─┬→ Restarting → Starting → …
//!                             └→ Degraded ──(operator restart)→ Starting
//! any state ──shutdown──→ Stopped
//! ```
//!
//! The supervisor exclusively owns the current [`ChildHandle`]. Other
//! components only see the child through the [`RequestSerializer`] input
//! slot, which is swapped on every generation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use llamavisor_core::TranscriptEntry;
use llamavisor_core::config::SupervisorSettings;

use crate::context::ServiceContext;
use crate::session::{ServiceEvent, SystemStatus};
use crate::stream::{DemuxConfig, StreamDemultiplexer};

use super::child::{ChildConfig, ChildHandle, SpawnError};
use super::serializer::RequestSerializer;

/// Backstop interval for noticing an exit that did not close stdout.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a dead generation's reader may take to drain buffered output.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Degraded,
    Restarting,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// Why a child generation ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChildDiedError {
    #[error("Child exited unexpectedly (code: {code:?})")]
    Exited { code: Option<i32> },

    #[error("Child closed its output")]
    OutputClosed,

    #[error("No sentinel within {timeout:?} of a submission, child presumed hung")]
    Stalled { timeout: Duration },

    #[error("Child input channel broke")]
    InputBroken,

    #[error("Failed to read child output: {reason}")]
    ReadFailed { reason: String },
}

/// Restart budget.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before entering Degraded.
    pub max_restarts: u32,
    pub delay: Duration,
    /// A generation that lived this long resets the failure count.
    pub healthy_uptime: Duration,
    pub terminate_timeout: Duration,
}

impl RestartPolicy {
    pub const fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            delay: settings.restart_delay(),
            healthy_uptime: settings.healthy_uptime(),
            terminate_timeout: settings.terminate_timeout(),
        }
    }
}

/// Everything needed to launch and read one child generation.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub child: ChildConfig,
    pub demux: DemuxConfig,
    pub policy: RestartPolicy,
}

/// Wake-ups delivered to the supervisor loop from other components.
#[derive(Debug, Clone, Default)]
pub struct SupervisorSignals {
    /// A prompt write failed against the current child.
    pub input_failed: Arc<Notify>,
    /// Operator asked for a fresh start while Degraded.
    pub restart_requested: Arc<Notify>,
}

struct Generation {
    handle: ChildHandle,
    reader: JoinHandle<ChildDiedError>,
    reader_done: bool,
    stderr: Option<JoinHandle<()>>,
    started_at: Instant,
}

enum Wake {
    Reader(Result<ChildDiedError, JoinError>),
    InputBroken,
    Tick,
}

/// Owns the child process and drives its state machine.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    ctx: ServiceContext,
    serializer: Arc<RequestSerializer>,
    status: watch::Sender<SystemStatus>,
    signals: SupervisorSignals,
    transcript: Option<mpsc::Sender<TranscriptEntry>>,
    current: Option<Generation>,
    generation: u64,
    consecutive_failures: u32,
    restarts: u64,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        ctx: ServiceContext,
        serializer: Arc<RequestSerializer>,
        status: watch::Sender<SystemStatus>,
        signals: SupervisorSignals,
        transcript: Option<mpsc::Sender<TranscriptEntry>>,
    ) -> Self {
        Self {
            config,
            ctx,
            serializer,
            status,
            signals,
            transcript,
            current: None,
            generation: 0,
            consecutive_failures: 0,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Spawn a new child generation and wire its streams.
    ///
    /// On success the state is Ready and the serializer writes to the new
    /// child. On failure nothing is left running.
    pub async fn start(&mut self) -> Result<(), SpawnError> {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(SupervisorState::Starting, None);

        let mut handle = ChildHandle::spawn(&self.config.child, generation)?;
        let stdout = handle.take_stdout()?;
        let stdin = handle.take_stdin()?;
        let stderr = handle
            .take_stderr()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, generation)));

        let demux = StreamDemultiplexer::new(
            stdout,
            &self.config.demux,
            generation,
            self.ctx.clone(),
            self.transcript.clone(),
        );
        let reader = tokio::spawn(demux.run());
        self.serializer.attach(stdin, generation).await;

        self.current = Some(Generation {
            handle,
            reader,
            reader_done: false,
            stderr,
            started_at: Instant::now(),
        });
        self.set_state(SupervisorState::Ready, None);
        Ok(())
    }

    /// Non-blocking liveness check of the current child.
    ///
    /// Returns the cause once the process has been observed to exit.
    pub fn poll(&mut self) -> Option<ChildDiedError> {
        let status = self.current.as_mut()?.handle.try_exit()?;
        Some(ChildDiedError::Exited {
            code: status.code(),
        })
    }

    /// Supervise until `shutdown` flips to `true` (or its sender is dropped),
    /// then stop the child.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let cause = tokio::select! {
                cause = self.next_death() => cause,
                () = shutdown_requested(&mut shutdown) => break,
            };
            if !self.recover(cause, &mut shutdown).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Stop the current child (graceful terminate, then kill) and enter Stopped.
    pub async fn shutdown(&mut self) {
        if let Some(uptime) = self.stop_generation().await {
            debug!(generation = self.generation, ?uptime, "Final generation stopped");
        }
        self.set_state(SupervisorState::Stopped, None);
        info!(
            generations = self.generation,
            restarts = self.restarts,
            "Supervisor stopped"
        );
    }

    /// Wait until the current generation dies. Pending forever when there is
    /// no child.
    async fn next_death(&mut self) -> ChildDiedError {
        let mut tick = tokio::time::interval(EXIT_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let Some(current) = self.current.as_mut() else {
                return std::future::pending().await;
            };
            let wake = tokio::select! {
                res = &mut current.reader, if !current.reader_done => Wake::Reader(res),
                () = self.signals.input_failed.notified() => Wake::InputBroken,
                _ = tick.tick() => Wake::Tick,
            };
            match wake {
                Wake::Reader(res) => {
                    current.reader_done = true;
                    return match res {
                        Ok(cause) => cause,
                        Err(e) => ChildDiedError::ReadFailed {
                            reason: e.to_string(),
                        },
                    };
                }
                Wake::InputBroken => return ChildDiedError::InputBroken,
                Wake::Tick => {
                    if let Some(cause) = self.poll() {
                        return cause;
                    }
                }
            }
        }
    }

    /// Handle a dead generation: account the failure, then either restart or
    /// park in Degraded. Returns `false` when shutdown was requested meanwhile.
    async fn recover(&mut self, cause: ChildDiedError, shutdown: &mut watch::Receiver<bool>) -> bool {
        let uptime = self
            .current
            .as_ref()
            .map_or(Duration::ZERO, |g| g.started_at.elapsed());
        if uptime >= self.config.policy.healthy_uptime {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures += 1;

        warn!(
            generation = self.generation,
            %cause,
            ?uptime,
            consecutive_failures = self.consecutive_failures,
            "Child died"
        );
        let mut detail = cause.to_string();

        loop {
            let state = self.failure_state();
            self.set_state(state, Some(detail.clone()));
            // No-op once the dead generation is released.
            self.stop_generation().await;

            if state == SupervisorState::Degraded {
                error!(
                    consecutive_failures = self.consecutive_failures,
                    max_restarts = self.config.policy.max_restarts,
                    "Restart budget exhausted, waiting for operator restart"
                );
                tokio::select! {
                    () = self.signals.restart_requested.notified() => {
                        info!("Operator restart requested");
                        self.consecutive_failures = 0;
                    }
                    () = shutdown_requested(shutdown) => return false,
                }
            } else {
                tokio::select! {
                    () = tokio::time::sleep(self.config.policy.delay) => {}
                    () = shutdown_requested(shutdown) => return false,
                }
            }

            self.restarts += 1;
            match self.start().await {
                Ok(()) => {
                    info!(
                        generation = self.generation,
                        restarts = self.restarts,
                        "Child restarted"
                    );
                    return true;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!(
                        generation = self.generation,
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "Restart attempt failed"
                    );
                    detail = e.to_string();
                }
            }
        }
    }

    const fn failure_state(&self) -> SupervisorState {
        if self.consecutive_failures > self.config.policy.max_restarts {
            SupervisorState::Degraded
        } else {
            SupervisorState::Restarting
        }
    }

    /// Release the current generation. Returns its uptime.
    async fn stop_generation(&mut self) -> Option<Duration> {
        let mut current = self.current.take()?;
        let generation = current.handle.generation();

        // Kill first: a hung child may be blocking a write that holds the
        // input lock.
        current
            .handle
            .terminate(self.config.policy.terminate_timeout)
            .await;
        self.serializer.detach().await;
        self.discard_stale_input_failure().await;

        if !current.reader_done {
            match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut current.reader).await {
                Ok(Ok(cause)) => debug!(generation, %cause, "Reader finished"),
                Ok(Err(e)) => warn!(generation, error = %e, "Reader task failed"),
                Err(_) => {
                    warn!(generation, "Reader did not drain, aborting");
                    current.reader.abort();
                }
            }
        }
        if let Some(stderr) = current.stderr {
            stderr.abort();
        }

        let dropped = self.ctx.in_flight.clear();
        if dropped > 0 {
            warn!(generation, dropped, "Requests awaiting output were dropped");
        }
        info!(generation, exit_code = ?current.handle.exit_code(), "Child released");
        Some(current.started_at.elapsed())
    }

    /// Consume a wake-up left behind by a write against a generation that is
    /// already gone.
    async fn discard_stale_input_failure(&self) {
        let _ = tokio::time::timeout(Duration::ZERO, self.signals.input_failed.notified()).await;
    }

    fn set_state(&self, state: SupervisorState, detail: Option<String>) {
        let status = SystemStatus {
            state,
            generation: self.generation,
            consecutive_failures: self.consecutive_failures,
            restarts: self.restarts,
            detail,
        };
        let previous = self.status.send_replace(status.clone());
        if previous.state != state {
            info!(from = %previous.state, to = %state, generation = self.generation, "Supervisor state changed");
        }
        self.ctx.broadcaster.publish(ServiceEvent::Status(status));
    }
}

async fn forward_stderr(stderr: ChildStderr, generation: u64) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(generation, "stderr: {}", line);
    }
    debug!(generation, "stderr reader finished");
}

/// Resolves once shutdown is flagged or the flag's sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn state_display_matches_serde_name() {
        for state in [
            SupervisorState::Stopped,
            SupervisorState::Starting,
            SupervisorState::Ready,
            SupervisorState::Degraded,
            SupervisorState::Restarting,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn policy_from_default_settings() {
        let policy = RestartPolicy::from_settings(&SupervisorSettings::default());
        assert_eq!(policy.max_restarts, 3);
        assert_eq!(policy.delay, Duration::from_millis(1500));
        assert_eq!(policy.terminate_timeout, Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_poll_and_shutdown_walk_the_states() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("child.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf 'hi\\n### User:'\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let model = dir.path().join("m.gguf");
        std::fs::write(&model, b"").unwrap();

        let config = SupervisorConfig {
            child: ChildConfig {
                executable: script,
                model_path: model,
                threads: 1,
                context_size: 128,
                temperature: 1.0,
                max_tokens: 8,
                sentinel: "### User:".into(),
                extra_args: Vec::new(),
            },
            demux: DemuxConfig {
                sentinel: "### User:".into(),
                max_buffer_bytes: 1024,
                stall_timeout: None,
            },
            policy: RestartPolicy::from_settings(&SupervisorSettings::default()),
        };
        let ctx = ServiceContext::new(16, 16, 16);
        let (status_tx, status_rx) = watch::channel(SystemStatus::stopped());
        let signals = SupervisorSignals::default();
        let serializer = Arc::new(RequestSerializer::new(
            status_rx,
            Arc::clone(&ctx.in_flight),
            Arc::clone(&ctx.conversation),
            Arc::clone(&signals.input_failed),
            "",
        ));
        let mut sub = ctx.broadcaster.subscribe();
        let mut supervisor =
            ProcessSupervisor::new(config, ctx.clone(), serializer, status_tx, signals, None);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(supervisor.generation(), 1);
        assert!(supervisor.poll().is_none());

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        let states: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|event| match event {
                ServiceEvent::Status(status) => Some(status.state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                SupervisorState::Starting,
                SupervisorState::Ready,
                SupervisorState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_flag_and_dropped_sender_both_resolve() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .unwrap();
    }
}
