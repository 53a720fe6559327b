//! Configuration resolution for llamavisor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/llamavisor/settings.json)
//! 3. Project config (.llamavisor/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file that only sets
//! `child.model_path` keeps every other value from the layers below it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete llamavisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub child: ChildSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub events: EventSettings,
    #[serde(default)]
    pub transcript: TranscriptSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            child: ChildSettings::default(),
            supervisor: SupervisorSettings::default(),
            stream: StreamSettings::default(),
            events: EventSettings::default(),
            transcript: TranscriptSettings::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How the inference executable is launched and spoken to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildSettings {
    pub executable: PathBuf,
    pub model_path: PathBuf,
    pub threads: u32,
    pub context_size: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Marker the child prints when it is ready for the next prompt.
    pub sentinel: String,
    /// Appended to every prompt before the line terminator.
    pub prompt_suffix: String,
    pub extra_args: Vec<String>,
}

impl Default for ChildSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("../llama.cpp/llama/bin/llama-cli"),
            model_path: PathBuf::from("models/Qwen3-0.6B-Q4_K_M.gguf"),
            threads: 4,
            context_size: 2048,
            temperature: 1.0,
            max_tokens: 64,
            sentinel: "### User:".to_string(),
            prompt_suffix: "/no_think".to_string(),
            extra_args: vec!["--interactive".to_string(), "--simple-io".to_string()],
        }
    }
}

/// Restart and termination policy for the child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Consecutive failures tolerated before entering the degraded state.
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    /// Uptime after which a generation counts as healthy and the failure
    /// counter resets.
    pub healthy_uptime_secs: u64,
    pub terminate_timeout_secs: u64,
    /// Zero disables stall detection.
    pub stall_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay_ms: 1500,
            healthy_uptime_secs: 30,
            terminate_timeout_secs: 5,
            stall_timeout_secs: 120,
        }
    }
}

impl SupervisorSettings {
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub const fn healthy_uptime(&self) -> Duration {
        Duration::from_secs(self.healthy_uptime_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn stall_timeout(&self) -> Option<Duration> {
        if self.stall_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stall_timeout_secs))
        }
    }
}

/// Output stream demultiplexing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub max_buffer_bytes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// Event fan-out and retained history sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Pending events a subscriber may fall behind before the oldest are dropped.
    pub subscriber_capacity: usize,
    pub sample_history: usize,
    pub turn_history: usize,
    pub sample_interval_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            sample_history: 100,
            turn_history: 100,
            sample_interval_ms: 1000,
        }
    }
}

impl EventSettings {
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// JSON-lines transcript of prompt/response pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for TranscriptSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("logs").join("llama_log.jsonl"),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            merge_values(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llamavisor").join("settings.json"))
}

/// Get the project config file path for a directory.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".llamavisor").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Deep-merge `overlay` into `base`; objects merge per key, anything else replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `LLAMAVISOR_*` overrides read through `lookup`.
///
/// A variable that is set but does not parse is an error rather than being
/// silently ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
        raw.trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}")))
    }

    if let Some(val) = lookup("LLAMAVISOR_EXECUTABLE") {
        config.child.executable = PathBuf::from(val);
    }
    if let Some(val) = lookup("LLAMAVISOR_MODEL") {
        config.child.model_path = PathBuf::from(val);
    }
    if let Some(val) = lookup("LLAMAVISOR_THREADS") {
        config.child.threads = parsed("LLAMAVISOR_THREADS", &val)?;
    }
    if let Some(val) = lookup("LLAMAVISOR_CTX_SIZE") {
        config.child.context_size = parsed("LLAMAVISOR_CTX_SIZE", &val)?;
    }
    if let Some(val) = lookup("LLAMAVISOR_TEMPERATURE") {
        config.child.temperature = parsed("LLAMAVISOR_TEMPERATURE", &val)?;
    }
    if let Some(val) = lookup("LLAMAVISOR_MAX_TOKENS") {
        config.child.max_tokens = parsed("LLAMAVISOR_MAX_TOKENS", &val)?;
    }
    if let Some(val) = lookup("LLAMAVISOR_SENTINEL") {
        config.child.sentinel = val;
    }
    if let Some(val) = lookup("LLAMAVISOR_MAX_RESTARTS") {
        config.supervisor.max_restarts = parsed("LLAMAVISOR_MAX_RESTARTS", &val)?;
    }
    if let Some(val) = lookup("LLAMAVISOR_TRANSCRIPT") {
        config.transcript.path = PathBuf::from(val);
    }
    if let Some(val) = lookup("LLAMAVISOR_LOG_LEVEL") {
        config.log_level = val;
    }
    Ok(())
}

impl Config {
    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.child.sentinel.is_empty() {
            return Err(Error::Config("child.sentinel must not be empty".into()));
        }
        if self.stream.max_buffer_bytes < self.child.sentinel.len() {
            return Err(Error::Config(
                "stream.max_buffer_bytes must be at least the sentinel length".into(),
            ));
        }
        if self.events.subscriber_capacity == 0 {
            return Err(Error::Config("events.subscriber_capacity must be > 0".into()));
        }
        if self.events.sample_interval_ms == 0 {
            return Err(Error::Config("events.sample_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}
