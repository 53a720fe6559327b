//! The assembled service: one supervised child, its serializer, the
//! sampler and the transcript writer, behind a small caller-facing API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use llamavisor_core::{Config, TranscriptEntry, TranscriptLog};

use crate::context::ServiceContext;
use crate::sampler::{MetricsSource, ResourceSampler, SysinfoSource};
use crate::session::{RequestId, ResourceSample, Subscription, SystemStatus, Turn};
use crate::stream::DemuxConfig;
use crate::subprocess::{
    ChildConfig, ProcessSupervisor, RequestSerializer, RestartPolicy, SpawnError, SubmitError,
    SupervisorConfig, SupervisorSignals, SupervisorState,
};

/// Transcript entries buffered ahead of the writer task.
const TRANSCRIPT_QUEUE: usize = 256;

/// Upper bound on waiting for queued transcript entries at shutdown.
const TRANSCRIPT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully resolved service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub supervisor: SupervisorConfig,
    pub prompt_suffix: String,
    pub subscriber_capacity: usize,
    pub turn_history: usize,
    pub sample_history: usize,
    pub sample_interval: Duration,
    /// `None` disables the transcript.
    pub transcript_path: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            supervisor: SupervisorConfig {
                child: ChildConfig::from_settings(&config.child),
                demux: DemuxConfig {
                    sentinel: config.child.sentinel.clone(),
                    max_buffer_bytes: config.stream.max_buffer_bytes,
                    stall_timeout: config.supervisor.stall_timeout(),
                },
                policy: RestartPolicy::from_settings(&config.supervisor),
            },
            prompt_suffix: config.child.prompt_suffix.clone(),
            subscriber_capacity: config.events.subscriber_capacity,
            turn_history: config.events.turn_history,
            sample_history: config.events.sample_history,
            sample_interval: config.events.sample_interval(),
            transcript_path: config
                .transcript
                .enabled
                .then(|| config.transcript.path.clone()),
        }
    }

    /// Reject settings the background tasks cannot run with.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.supervisor.demux.sentinel.is_empty() {
            return Err(ServiceError::InvalidConfig("sentinel must not be empty".into()));
        }
        if self.sample_interval.is_zero() {
            return Err(ServiceError::InvalidConfig("sample interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Errors from starting or stopping the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid service configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start child: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Service task failed: {0}")]
    Task(#[from] JoinError),
}

/// Point-in-time view of the service, suitable for an on-connect payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: SystemStatus,
    pub latest_sample: Option<ResourceSample>,
    pub samples: Vec<ResourceSample>,
    pub turns: Vec<Turn>,
    pub subscribers: usize,
}

/// Handle to a running service.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) still stops the
/// child: the supervisor treats the vanished shutdown sender as a request.
pub struct LlamaService {
    ctx: ServiceContext,
    serializer: Arc<RequestSerializer>,
    status: watch::Receiver<SystemStatus>,
    signals: SupervisorSignals,
    shutdown_tx: watch::Sender<bool>,
    supervisor_task: JoinHandle<()>,
    sampler_task: JoinHandle<()>,
    transcript_task: Option<JoinHandle<()>>,
}

impl LlamaService {
    /// Start the child and background tasks, sampling host metrics with `sysinfo`.
    ///
    /// A child that cannot be spawned is a fatal error.
    pub async fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::start_with_metrics(config, SysinfoSource::new()).await
    }

    pub async fn start_with_metrics<S: MetricsSource>(
        config: ServiceConfig,
        metrics: S,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let ctx = ServiceContext::new(
            config.subscriber_capacity,
            config.turn_history,
            config.sample_history,
        );
        let (status_tx, status_rx) = watch::channel(SystemStatus::stopped());
        let signals = SupervisorSignals::default();
        let serializer = Arc::new(RequestSerializer::new(
            status_rx.clone(),
            Arc::clone(&ctx.in_flight),
            Arc::clone(&ctx.conversation),
            Arc::clone(&signals.input_failed),
            config.prompt_suffix.clone(),
        ));

        let (transcript_tx, transcript_task) = match config.transcript_path {
            Some(path) => {
                let (tx, rx) = mpsc::channel(TRANSCRIPT_QUEUE);
                let log = TranscriptLog::new(path);
                info!(path = %log.path().display(), "Transcript enabled");
                (Some(tx), Some(tokio::spawn(write_transcript(log, rx))))
            }
            None => (None, None),
        };

        let mut supervisor = ProcessSupervisor::new(
            config.supervisor,
            ctx.clone(),
            Arc::clone(&serializer),
            status_tx,
            signals.clone(),
            transcript_tx,
        );
        supervisor.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));
        let sampler_task = ResourceSampler::new(
            metrics,
            config.sample_interval,
            Arc::clone(&ctx.resources),
            Arc::clone(&ctx.broadcaster),
        )
        .spawn(shutdown_rx);

        info!("Service started");
        Ok(Self {
            ctx,
            serializer,
            status: status_rx,
            signals,
            shutdown_tx,
            supervisor_task,
            sampler_task,
            transcript_task,
        })
    }

    /// Write a prompt to the child. Returns once it is flushed; the answer
    /// arrives as a model turn tagged with the returned id.
    pub async fn submit(&self, prompt: &str) -> Result<RequestId, SubmitError> {
        self.serializer.submit(prompt).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.ctx.broadcaster.subscribe()
    }

    /// Register a subscriber, then capture the snapshot, so nothing published
    /// after the snapshot is missed.
    pub fn subscribe_with_snapshot(&self) -> (Subscription, StatusSnapshot) {
        let subscription = self.subscribe();
        (subscription, self.status())
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status.borrow().clone(),
            latest_sample: self.ctx.resources.latest(),
            samples: self.ctx.resources.snapshot(),
            turns: self.ctx.conversation.recent(),
            subscribers: self.ctx.broadcaster.subscriber_count(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    /// Receiver that observes every supervisor status change.
    pub fn status_watch(&self) -> watch::Receiver<SystemStatus> {
        self.status.clone()
    }

    /// Leave Degraded by attempting a fresh start with a reset failure budget.
    ///
    /// Returns `false` (and does nothing) in any other state.
    pub fn request_restart(&self) -> bool {
        let state = self.state();
        if state != SupervisorState::Degraded {
            debug!(%state, "Restart request ignored");
            return false;
        }
        self.signals.restart_requested.notify_one();
        true
    }

    /// Stop the child and every background task.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        info!("Service shutting down");
        let _ = self.shutdown_tx.send(true);
        self.supervisor_task.await?;
        self.sampler_task.await?;

        // The writer ends once every sender (held by the supervisor and its
        // readers) is gone.
        if let Some(task) = self.transcript_task {
            match tokio::time::timeout(TRANSCRIPT_FLUSH_TIMEOUT, task).await {
                Ok(result) => result?,
                Err(_) => warn!("Transcript writer did not finish in time"),
            }
        }
        info!("Service stopped");
        Ok(())
    }
}

async fn write_transcript(log: TranscriptLog, mut rx: mpsc::Receiver<TranscriptEntry>) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = log.append(&entry).await {
            warn!(path = %log.path().display(), error = %e, "Failed to append transcript entry");
        }
    }
    debug!("Transcript writer finished");
}
