//! llamavisor
//!
//! Runs the inference child under supervision and chats with it from the
//! terminal: one prompt per stdin line, model turns on stdout.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use llamavisor_core::config::{Config, load_config};
use llamavisor_core::tracing_init::{default_filter, init_tracing};
use llamavisor_core::TranscriptLog;
use llamavisor_daemon::session::{Role, ServiceEvent, Subscription};
use llamavisor_daemon::subprocess::{SubmitError, SupervisorState};
use llamavisor_daemon::{LlamaService, ServiceConfig};

/// Typed at the prompt to leave.
const EXIT_COMMAND: &str = "exit";
/// Typed at the prompt to leave Degraded.
const RESTART_COMMAND: &str = "/restart";

#[derive(Parser, Debug)]
#[command(name = "llamavisor")]
#[command(version, about = "Supervised interactive inference subprocess")]
struct Args {
    /// Path to the inference executable
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Path to the model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Inference threads
    #[arg(long)]
    threads: Option<u32>,

    /// Context size in tokens
    #[arg(long)]
    ctx_size: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    temp: Option<f32>,

    /// Maximum tokens generated per turn
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Marker the child prints when it waits for input
    #[arg(long)]
    sentinel: Option<String>,

    /// Consecutive failures tolerated before entering degraded mode
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Transcript file (JSON lines)
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Do not write a transcript
    #[arg(long, env = "LLAMAVISOR_NO_TRANSCRIPT")]
    no_transcript: bool,

    /// Print the last N transcript entries as JSON and exit
    #[arg(long, value_name = "N")]
    tail_logs: Option<usize>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LLAMAVISOR_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags take precedence over every configuration layer.
    fn apply(&self, config: &mut Config) {
        if let Some(executable) = &self.executable {
            config.child.executable.clone_from(executable);
        }
        if let Some(model) = &self.model {
            config.child.model_path.clone_from(model);
        }
        if let Some(threads) = self.threads {
            config.child.threads = threads;
        }
        if let Some(ctx_size) = self.ctx_size {
            config.child.context_size = ctx_size;
        }
        if let Some(temp) = self.temp {
            config.child.temperature = temp;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.child.max_tokens = max_tokens;
        }
        if let Some(sentinel) = &self.sentinel {
            config.child.sentinel.clone_from(sentinel);
        }
        if let Some(max_restarts) = self.max_restarts {
            config.supervisor.max_restarts = max_restarts;
        }
        if let Some(path) = &self.transcript {
            config.transcript.path.clone_from(path);
        }
        if self.no_transcript {
            config.transcript.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir()?;
    let mut config = load_config(Some(cwd.as_path()))?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(
        &default_filter("llamavisor_daemon", &config.log_level),
        args.log_json,
    );

    if let Some(count) = args.tail_logs {
        return tail_logs(&config, count).await;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        executable = %config.child.executable.display(),
        model = %config.child.model_path.display(),
        "Starting llamavisor"
    );
    let service = LlamaService::start(ServiceConfig::from_config(&config)).await?;
    let printer = tokio::spawn(print_events(service.subscribe()));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        () = prompt_loop(&service, spawn_stdin_reader()) => {
            info!("Input closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    service.shutdown().await?;
    // The subscription ends once the service's broadcaster is gone.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}

/// Read stdin on a plain thread; a blocking read must not hold up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[allow(clippy::print_stderr)]
async fn prompt_loop(service: &LlamaService, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let prompt = line.trim();
        if prompt.eq_ignore_ascii_case(EXIT_COMMAND) {
            return;
        }
        if prompt == RESTART_COMMAND {
            if !service.request_restart() {
                eprintln!("Restart is only available in degraded mode");
            }
            continue;
        }
        if prompt.is_empty() {
            continue;
        }
        match service.submit(prompt).await {
            Ok(id) => debug!(request_id = %id, "Prompt submitted"),
            Err(SubmitError::NotReady {
                state: SupervisorState::Degraded,
            }) => {
                eprintln!("Model is unavailable; type {RESTART_COMMAND} to try again");
            }
            Err(e) => eprintln!("{e}"),
        }
    }
}

#[allow(clippy::print_stdout)]
async fn print_events(mut events: Subscription) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceEvent::Turn(turn) if turn.role == Role::Model => println!("{}", turn.text),
            ServiceEvent::Status(status) => match status.detail {
                Some(detail) => println!("[{}] {detail}", status.state),
                None => println!("[{}]", status.state),
            },
            ServiceEvent::Diagnostic(diagnostic) => println!("[diagnostic] {}", diagnostic.message),
            ServiceEvent::Turn(_) | ServiceEvent::Resource(_) => {}
        }
    }
}

#[allow(clippy::print_stdout)]
async fn tail_logs(config: &Config, count: usize) -> anyhow::Result<()> {
    let log = TranscriptLog::new(&config.transcript.path);
    for entry in log.tail(count).await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}
