//! Application configuration for pipehub.
//!
//! User config lives at `~/.pipehub/pipehub.toml`. When the file is absent,
//! built-in defaults apply: the build/harden/docs pipelines, each dispatching
//! to the backing `agent` process and gated on the search-index and web-ui
//! services.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipehubError, Result};
use crate::types::{Pipeline, ServiceTarget};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pipehub.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pipehub";

// ---------------------------------------------------------------------------
// Config structs (matching pipehub.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Probed service targets.
    #[serde(default = "default_services")]
    pub services: Vec<ServiceEntry>,

    /// Registered tasks (command-backed handlers).
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskEntry>,

    /// Named pipelines.
    #[serde(default = "default_pipelines")]
    pub pipelines: Vec<PipelineEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            services: default_services(),
            tasks: default_tasks(),
            pipelines: default_pipelines(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Number of queue workers in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a worker blocks on a queue pull before re-checking shutdown.
    #[serde(default = "default_queue_poll_timeout_ms")]
    pub queue_poll_timeout_ms: u64,

    /// Per-task execution timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Overall deadline for the readiness gate.
    #[serde(default = "default_readiness_deadline_secs")]
    pub readiness_deadline_secs: u64,

    /// Interval between readiness probe cycles.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Per-probe request timeout, unless a service overrides it.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_poll_timeout_ms: default_queue_poll_timeout_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            readiness_deadline_secs: default_readiness_deadline_secs(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_poll_timeout_ms() -> u64 {
    250
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_readiness_deadline_secs() -> u64 {
    60
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}

/// `[[services]]` entry — a dependent service with a liveness endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service name referenced by pipelines.
    pub name: String,
    /// Liveness URL (e.g., `http://127.0.0.1:8200/health`).
    pub url: String,
    /// Per-probe timeout override in ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
    /// Readiness deadline override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

/// `[[tasks]]` entry — a named task backed by an external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Task name referenced by pipelines.
    pub name: String,
    /// Command executed when the task runs.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[[pipelines]]` entry — an ordered task list plus service dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEntry {
    /// Pipeline name used on the CLI.
    pub name: String,
    /// Ordered task names.
    pub tasks: Vec<String>,
    /// Names of `[[services]]` entries this pipeline waits on.
    #[serde(default)]
    pub requires: Vec<String>,
}

// ---------------------------------------------------------------------------
// Built-in defaults
// ---------------------------------------------------------------------------

fn default_services() -> Vec<ServiceEntry> {
    vec![
        ServiceEntry {
            name: "search-index".into(),
            url: "http://127.0.0.1:8200/health".into(),
            probe_timeout_ms: None,
            deadline_secs: None,
        },
        ServiceEntry {
            name: "web-ui".into(),
            url: "http://127.0.0.1:3000/health".into(),
            probe_timeout_ms: None,
            deadline_secs: None,
        },
    ]
}

fn default_tasks() -> Vec<TaskEntry> {
    ["build", "harden", "docs"]
        .into_iter()
        .map(|name| TaskEntry {
            name: name.into(),
            command: "agent".into(),
            args: vec!["run".into(), name.into()],
        })
        .collect()
}

fn default_pipelines() -> Vec<PipelineEntry> {
    ["build", "harden", "docs"]
        .into_iter()
        .map(|name| PipelineEntry {
            name: name.into(),
            tasks: vec![name.into()],
            requires: vec!["search-index".into(), "web-ui".into()],
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Resolved runtime config
// ---------------------------------------------------------------------------

/// Runtime configuration with parsed URLs, durations, and resolved pipeline
/// dependencies. Produced once at startup via [`AppConfig::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Queue pull timeout per poll.
    pub queue_poll_timeout: Duration,
    /// Per-task execution timeout.
    pub task_timeout: Duration,
    /// Overall readiness-gate deadline.
    pub readiness_deadline: Duration,
    /// Interval between probe cycles.
    pub probe_interval: Duration,
    /// Command-backed task definitions, in config order.
    pub tasks: Vec<TaskEntry>,
    /// Pipelines with their service dependencies resolved.
    pub pipelines: Vec<Pipeline>,
    /// All configured service targets by name.
    pub services: HashMap<String, ServiceTarget>,
}

impl AppConfig {
    /// Validate the config and resolve it into runtime values.
    ///
    /// Fails on malformed service URLs, probe timeouts that are not shorter
    /// than their deadline, and pipelines referencing unknown services.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let defaults = &self.defaults;
        let readiness_deadline = Duration::from_secs(defaults.readiness_deadline_secs);

        let mut services = HashMap::new();
        for entry in &self.services {
            let url = Url::parse(&entry.url).map_err(|e| {
                PipehubError::validation(format!(
                    "service '{}': invalid URL '{}': {e}",
                    entry.name, entry.url
                ))
            })?;
            let probe_timeout = Duration::from_millis(
                entry.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
            );
            let deadline = entry
                .deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(readiness_deadline);
            let target = ServiceTarget::new(&entry.name, url, probe_timeout, deadline)?;
            if services.insert(entry.name.clone(), target).is_some() {
                return Err(PipehubError::validation(format!(
                    "service '{}' is defined twice",
                    entry.name
                )));
            }
        }

        let mut pipelines = Vec::new();
        for entry in &self.pipelines {
            let mut requires = Vec::new();
            for service_name in &entry.requires {
                let target = services.get(service_name).ok_or_else(|| {
                    PipehubError::validation(format!(
                        "pipeline '{}' requires unknown service '{service_name}'",
                        entry.name
                    ))
                })?;
                requires.push(target.clone());
            }
            pipelines.push(Pipeline {
                name: entry.name.clone(),
                tasks: entry.tasks.clone(),
                requires,
            });
        }

        Ok(ResolvedConfig {
            workers: defaults.workers,
            queue_poll_timeout: Duration::from_millis(defaults.queue_poll_timeout_ms),
            task_timeout: Duration::from_secs(defaults.task_timeout_secs),
            readiness_deadline,
            probe_interval: Duration::from_millis(defaults.probe_interval_ms),
            tasks: self.tasks.clone(),
            pipelines,
            services,
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pipehub/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipehubError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pipehub/pipehub.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipehubError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        PipehubError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipehubError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipehubError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipehubError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
