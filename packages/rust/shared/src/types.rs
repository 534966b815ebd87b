//! Core domain types for pipehub task orchestration.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{PipehubError, Result};

/// Parameter map passed to task handlers (invocation params override the
/// task's registered defaults, key by key).
pub type TaskParams = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// InvocationId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for task invocation identifiers (time-sortable).
///
/// An invocation id is never reused, even across process restarts with a
/// persistent queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    /// Generate a new time-sortable invocation identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InvocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TaskInvocation
// ---------------------------------------------------------------------------

/// One request to run a specific task with specific parameters.
///
/// Created when a caller enqueues work, consumed by a worker, and dropped
/// once its [`TaskResult`] is recorded. The queue provides at-least-once
/// delivery, so a worker may see the same invocation twice; handlers must
/// tolerate duplicate execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInvocation {
    /// Unique invocation identifier.
    pub id: InvocationId,
    /// Name of the registered task to execute.
    pub task: String,
    /// Caller-supplied parameters, merged over the task's defaults.
    #[serde(default)]
    pub params: TaskParams,
    /// When the invocation was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl TaskInvocation {
    /// Create a new invocation for the named task.
    pub fn new(task: impl Into<String>, params: TaskParams) -> Self {
        Self {
            id: InvocationId::new(),
            task: task.into(),
            params,
            submitted_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Terminal status of a task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// Outcome of one task invocation, produced by a worker on completion.
/// Immutable after creation.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// The invocation this result belongs to.
    pub invocation_id: InvocationId,
    /// Name of the executed task.
    pub task: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Handler output on success; empty otherwise.
    pub output: TaskParams,
    /// Error detail on failure or timeout.
    pub error: Option<String>,
    /// Wall-clock execution time observed by the worker.
    pub duration: Duration,
    /// When the worker began executing the handler.
    pub started_at: DateTime<Utc>,
    /// When the result was recorded.
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// Whether the invocation completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// ServiceTarget
// ---------------------------------------------------------------------------

/// Health status of one probed service, as of the last completed probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    /// The target was never reached before the deadline.
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A dependent service whose health gates pipeline execution.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    /// Service name used in verdicts and error messages.
    pub name: String,
    /// Liveness endpoint probed with a GET request.
    pub url: Url,
    /// Timeout for a single probe request.
    pub probe_timeout: Duration,
    /// Overall deadline for this service to become healthy.
    pub deadline: Duration,
}

impl ServiceTarget {
    /// Create a target, enforcing the `probe_timeout < deadline` invariant.
    pub fn new(
        name: impl Into<String>,
        url: Url,
        probe_timeout: Duration,
        deadline: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if probe_timeout >= deadline {
            return Err(PipehubError::validation(format!(
                "service '{name}': probe timeout {probe_timeout:?} must be shorter than deadline {deadline:?}"
            )));
        }
        Ok(Self {
            name,
            url,
            probe_timeout,
            deadline,
        })
    }
}

// ---------------------------------------------------------------------------
// ReadinessVerdict
// ---------------------------------------------------------------------------

/// Aggregated health outcome of probing all of a pipeline's required services.
///
/// `healthy` is true only when every target reported healthy within the same
/// probe cycle — transient flapping is never masked by stale success from an
/// earlier cycle.
#[derive(Debug, Clone)]
pub struct ReadinessVerdict {
    /// Last observed status per service name.
    pub services: BTreeMap<String, ServiceStatus>,
    /// Whether all services were healthy in one cycle.
    pub healthy: bool,
    /// Wall-clock time spent probing.
    pub elapsed: Duration,
}

impl ReadinessVerdict {
    /// Verdict for an empty target list: healthy, nothing probed.
    pub fn trivially_healthy() -> Self {
        Self {
            services: BTreeMap::new(),
            healthy: true,
            elapsed: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered sequence of tasks plus the services it depends on, run as one
/// logical unit. Static configuration, read-only at dispatch time.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name used on the CLI.
    pub name: String,
    /// Task names executed sequentially, in order.
    pub tasks: Vec<String>,
    /// Services that must report healthy before any task is submitted.
    pub requires: Vec<ServiceTarget>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_id_roundtrip() {
        let id = InvocationId::new();
        let s = id.to_string();
        let parsed: InvocationId = s.parse().expect("parse InvocationId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn invocation_ids_are_unique_and_sortable() {
        let a = InvocationId::new();
        let b = InvocationId::new();
        assert_ne!(a, b);
        // v7 ids embed a timestamp prefix, so later ids sort after earlier ones
        assert!(b.0 >= a.0);
    }

    #[test]
    fn invocation_serialization() {
        let mut params = TaskParams::new();
        params.insert("target".into(), serde_json::json!("release"));
        let inv = TaskInvocation::new("build", params);

        let json = serde_json::to_string(&inv).expect("serialize");
        let parsed: TaskInvocation = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, inv.id);
        assert_eq!(parsed.task, "build");
        assert_eq!(parsed.params["target"], serde_json::json!("release"));
    }

    #[test]
    fn service_target_rejects_timeout_at_or_over_deadline() {
        let url = Url::parse("http://localhost:8200/health").unwrap();
        let err = ServiceTarget::new(
            "search-index",
            url.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        assert!(err.is_err());

        let ok = ServiceTarget::new(
            "search-index",
            url,
            Duration::from_secs(2),
            Duration::from_secs(60),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn trivially_healthy_verdict_is_empty_and_instant() {
        let verdict = ReadinessVerdict::trivially_healthy();
        assert!(verdict.healthy);
        assert!(verdict.services.is_empty());
        assert_eq!(verdict.elapsed, Duration::ZERO);
    }
}
