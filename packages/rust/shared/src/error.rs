//! Error types for pipehub.
//!
//! Library crates use [`PipehubError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics and maps error
//! variants to distinct process exit codes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::ServiceStatus;

/// Top-level error type for all pipehub operations.
#[derive(Debug, thiserror::Error)]
pub enum PipehubError {
    /// A task name was registered twice (registry misuse, fatal at startup).
    #[error("task '{name}' is already registered")]
    DuplicateTask { name: String },

    /// A task name was looked up but never registered.
    #[error("unknown task '{name}'")]
    UnknownTask { name: String },

    /// A pipeline name was requested but is not configured.
    #[error("unknown pipeline '{name}'")]
    UnknownPipeline { name: String },

    /// Required services did not report healthy before the readiness deadline.
    /// Carries the last-known per-service status map; callers may retry later.
    #[error("dependencies not ready: {}", format_services(.services))]
    DependencyNotReady {
        services: BTreeMap<String, ServiceStatus>,
    },

    /// A task handler failed during execution.
    #[error("task '{task}' failed: {detail}")]
    TaskExecution { task: String, detail: String },

    /// A task handler ran past its per-task timeout. Cancellation is
    /// best-effort: the underlying work may still complete unobserved.
    #[error("task '{task}' timed out after {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },

    /// Queue connectivity loss. Retried with backoff by workers; fatal for a
    /// single worker after bounded retries, not for the pool.
    #[error("queue error: {0}")]
    QueueConnectivity(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed URL, timeout >= deadline, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipehubError>;

impl PipehubError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a task execution error for the named task.
    pub fn task_execution(task: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TaskExecution {
            task: task.into(),
            detail: detail.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Render a per-service status map as `name=status` pairs for error display.
fn format_services(services: &BTreeMap<String, ServiceStatus>) -> String {
    let mut parts: Vec<String> = services
        .iter()
        .map(|(name, status)| format!("{name}={status}"))
        .collect();
    parts.sort();
    parts.join(", ")
}
