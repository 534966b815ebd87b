//! Task registry: maps task names to executable handlers and their default
//! parameters.
//!
//! Registration happens once at startup, before any worker pulls from the
//! queue; the populated registry is then shared read-only behind an `Arc`,
//! so lookups need no locking. Handlers are async closures stored in a
//! string-keyed function table, validated at registration time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use pipehub_shared::{PipehubError, Result, TaskInvocation, TaskParams};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle.
///
/// Cancellation is advisory: a handler that never polls [`CancelFlag::is_cancelled`]
/// runs to completion regardless. True preemption is not guaranteed.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a new, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Task context & handler
// ---------------------------------------------------------------------------

/// Execution context handed to a task handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Name of the task being executed.
    pub task: String,
    /// Merged parameters: invocation params override registered defaults.
    pub params: TaskParams,
    /// Cooperative cancellation flag; long-running handlers may poll it
    /// between steps.
    pub cancelled: CancelFlag,
}

/// Key/value output produced by a successful handler.
pub type TaskOutput = TaskParams;

/// Boxed future returned by a task handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<TaskOutput>> + Send>>;

/// Type-erased task handler stored in the registry.
pub type HandlerFn = Arc<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A registered task: name, handler, and default parameters.
/// Immutable once registered; lives for the process lifetime.
#[derive(Clone)]
pub struct TaskDefinition {
    /// Unique task name.
    pub name: String,
    /// Default parameters applied beneath invocation params.
    pub defaults: TaskParams,
    handler: HandlerFn,
}

impl TaskDefinition {
    /// Merge an invocation's parameters over this task's defaults.
    pub fn merged_params(&self, invocation: &TaskInvocation) -> TaskParams {
        let mut merged = self.defaults.clone();
        for (key, value) in &invocation.params {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Invoke the handler with the given context.
    pub fn execute(&self, ctx: TaskContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// String-keyed table of task definitions.
///
/// Populate with [`TaskRegistry::register`] during bootstrap, then freeze
/// behind `Arc` for concurrent lookups from workers.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task handler under a unique name.
    ///
    /// The handler is any async closure from [`TaskContext`] to a
    /// [`TaskOutput`]; it is boxed here so callers never deal with the
    /// type-erased form.
    pub fn register<H, F>(
        &mut self,
        name: impl Into<String>,
        defaults: TaskParams,
        handler: H,
    ) -> Result<()>
    where
        H: Fn(TaskContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(PipehubError::DuplicateTask { name });
        }

        debug!(task = %name, defaults = defaults.len(), "registered task");
        let boxed: HandlerFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.tasks.insert(
            name.clone(),
            Arc::new(TaskDefinition {
                name,
                defaults,
                handler: boxed,
            }),
        );
        Ok(())
    }

    /// Look up a task definition by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<TaskDefinition>> {
        self.tasks.get(name).cloned().ok_or_else(|| {
            PipehubError::UnknownTask {
                name: name.to_string(),
            }
        })
    }

    /// Whether a task with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}
