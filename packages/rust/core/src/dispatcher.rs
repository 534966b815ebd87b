//! Pipeline dispatcher: readiness gate → sequential task execution.
//!
//! Tasks within one pipeline run sequentially — task N+1 is never submitted
//! before task N's result is observed, since later tasks may depend on
//! artifacts produced by earlier ones. This trades throughput for
//! correctness inside a pipeline; the worker pool's general fan-out remains
//! available for ad-hoc submissions outside it. A failed task stops the run
//! immediately; completed tasks are not rolled back (handlers are assumed
//! idempotent or individually recoverable by the operator).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use pipehub_probe::ReadinessProber;
use pipehub_queue::TaskQueue;
use pipehub_registry::{CancelFlag, TaskRegistry};
use pipehub_shared::{
    Pipeline, PipehubError, ReadinessVerdict, Result, TaskInvocation, TaskParams, TaskResult,
    TaskStatus,
};
use pipehub_worker::WorkerPool;

use crate::progress::ProgressReporter;

// ---------------------------------------------------------------------------
// PipelineOutcome
// ---------------------------------------------------------------------------

/// Result of a pipeline run (or dry run).
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Pipeline name.
    pub pipeline: String,
    /// Whether this was a dry run (nothing submitted).
    pub dry_run: bool,
    /// Ordered task names the pipeline would run / ran.
    pub planned: Vec<String>,
    /// Results of executed tasks, in order. Empty on dry run.
    pub results: Vec<TaskResult>,
    /// Readiness verdict, when the pipeline declared dependencies and the
    /// gate was evaluated.
    pub verdict: Option<ReadinessVerdict>,
    /// Whether the run stopped early because cancellation was requested.
    pub cancelled: bool,
    /// Total wall-clock time.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Top-level entry point: resolves a pipeline name, gates on service
/// readiness, and drives the worker pool.
///
/// Constructed once at startup from the resolved config — there is no
/// process-wide singleton; every collaborator is passed in explicitly.
pub struct Dispatcher<Q: TaskQueue> {
    pipelines: HashMap<String, Pipeline>,
    registry: Arc<TaskRegistry>,
    pool: Arc<WorkerPool<Q>>,
    prober: ReadinessProber,
    readiness_deadline: Duration,
}

impl<Q: TaskQueue> Dispatcher<Q> {
    /// Create a dispatcher over a static set of pipelines.
    pub fn new(
        pipelines: Vec<Pipeline>,
        registry: Arc<TaskRegistry>,
        pool: Arc<WorkerPool<Q>>,
        prober: ReadinessProber,
        readiness_deadline: Duration,
    ) -> Self {
        let pipelines = pipelines
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self {
            pipelines,
            registry,
            pool,
            prober,
            readiness_deadline,
        }
    }

    /// Configured pipelines, sorted by name.
    pub fn pipelines(&self) -> Vec<&Pipeline> {
        let mut all: Vec<&Pipeline> = self.pipelines.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve a pipeline by name.
    pub fn pipeline(&self, name: &str) -> Result<&Pipeline> {
        self.pipelines
            .get(name)
            .ok_or_else(|| PipehubError::UnknownPipeline {
                name: name.to_string(),
            })
    }

    /// Run the readiness gate for a pipeline without executing anything.
    pub async fn check(&self, name: &str) -> Result<ReadinessVerdict> {
        let pipeline = self.pipeline(name)?;
        let deadline = self.gate_deadline(pipeline);
        Ok(self.prober.check_all(&pipeline.requires, deadline).await)
    }

    /// Run a pipeline. `apply = false` is a dry run: the plan is validated
    /// and reported but nothing is probed or submitted.
    pub async fn run(
        &self,
        name: &str,
        apply: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome> {
        self.run_with_cancel(name, apply, &CancelFlag::new(), progress)
            .await
    }

    /// Run a pipeline with a caller-held cancellation flag.
    ///
    /// Cancellation stops further task submissions immediately but does not
    /// retroactively cancel a task already handed to a worker.
    #[instrument(skip_all, fields(pipeline = %name, apply))]
    pub async fn run_with_cancel(
        &self,
        name: &str,
        apply: bool,
        cancel: &CancelFlag,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome> {
        let start = Instant::now();
        let pipeline = self.pipeline(name)?;

        // Validate the whole plan up front; unknown tasks surface in dry
        // runs too.
        for task in &pipeline.tasks {
            self.registry.lookup(task)?;
        }

        if !apply {
            info!(tasks = pipeline.tasks.len(), "dry run, nothing submitted");
            let outcome = PipelineOutcome {
                pipeline: name.to_string(),
                dry_run: true,
                planned: pipeline.tasks.clone(),
                results: Vec::new(),
                verdict: None,
                cancelled: false,
                elapsed: start.elapsed(),
            };
            progress.done(&outcome);
            return Ok(outcome);
        }

        // Readiness gate: tasks are never submitted when dependencies are
        // not ready.
        let verdict = if pipeline.requires.is_empty() {
            None
        } else {
            progress.phase("Waiting for dependent services");
            let deadline = self.gate_deadline(pipeline);
            let verdict = self.prober.check_all(&pipeline.requires, deadline).await;
            if !verdict.healthy {
                warn!(services = ?verdict.services, "dependencies not ready, failing fast");
                return Err(PipehubError::DependencyNotReady {
                    services: verdict.services,
                });
            }
            Some(verdict)
        };

        let mut results = Vec::new();
        let mut cancelled = false;
        let total = pipeline.tasks.len();

        for (i, task) in pipeline.tasks.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(task = %task, "cancellation requested, stopping before next submission");
                cancelled = true;
                break;
            }

            progress.task_started(task, i + 1, total);
            let invocation = TaskInvocation::new(task.clone(), TaskParams::new());
            let ticket = self.pool.submit(invocation).await?;
            let result = ticket.wait().await?;
            progress.task_finished(&result, i + 1, total);

            match result.status {
                TaskStatus::Succeeded => results.push(result),
                TaskStatus::Failed => {
                    let detail = result
                        .error
                        .unwrap_or_else(|| "no error detail recorded".into());
                    return Err(PipehubError::task_execution(task, detail));
                }
                TaskStatus::TimedOut => {
                    return Err(PipehubError::TaskTimeout {
                        task: task.clone(),
                        timeout: self.pool.task_timeout(),
                    });
                }
            }
        }

        let outcome = PipelineOutcome {
            pipeline: name.to_string(),
            dry_run: false,
            planned: pipeline.tasks.clone(),
            results,
            verdict,
            cancelled,
            elapsed: start.elapsed(),
        };

        info!(
            tasks = outcome.results.len(),
            cancelled,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "pipeline run complete"
        );
        progress.done(&outcome);
        Ok(outcome)
    }

    /// Gate deadline: the longest per-target deadline, or the configured
    /// default when targets carry none.
    fn gate_deadline(&self, pipeline: &Pipeline) -> Duration {
        pipeline
            .requires
            .iter()
            .map(|t| t.deadline)
            .max()
            .unwrap_or(self.readiness_deadline)
    }
}
