//! Progress reporting for pipeline runs.

use pipehub_shared::TaskResult;

use crate::dispatcher::PipelineOutcome;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase (gating, execution).
    fn phase(&self, name: &str);
    /// Called when a task is submitted to the worker pool.
    fn task_started(&self, task: &str, current: usize, total: usize);
    /// Called when a task's result is recorded.
    fn task_finished(&self, result: &TaskResult, current: usize, total: usize);
    /// Called when the pipeline run completes.
    fn done(&self, outcome: &PipelineOutcome);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_started(&self, _task: &str, _current: usize, _total: usize) {}
    fn task_finished(&self, _result: &TaskResult, _current: usize, _total: usize) {}
    fn done(&self, _outcome: &PipelineOutcome) {}
}
