//! Worker pool: concurrent executors pulling task invocations from the queue.
//!
//! Ordering: each worker processes its own pulls in FIFO order, but there is
//! no global ordering across workers — invocations submitted as A then B may
//! complete in either order when picked up by different workers. That is the
//! queue's actual guarantee, not a bug to fix here.
//!
//! Delivery: the queue is at-least-once with no dedup, so a redelivered
//! invocation is executed again and its result discarded when the original
//! result was already recorded. Idempotency is a handler responsibility.
//!
//! Timeouts: a handler that outlives the per-task timeout produces a
//! `TimedOut` result, but the underlying work is abandoned, not stopped — it
//! runs on its own spawned task and any late result is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pipehub_queue::TaskQueue;
use pipehub_queue::backoff::{
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE, RECONNECT_CAP, reconnect_delay,
};
use pipehub_registry::{CancelFlag, TaskContext, TaskRegistry};
use pipehub_shared::{
    InvocationId, PipehubError, Result, TaskInvocation, TaskParams, TaskResult, TaskStatus,
};

// ---------------------------------------------------------------------------
// Pool configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long a worker blocks on a queue pull before re-checking shutdown.
    pub queue_poll_timeout: Duration,
    /// Per-task execution timeout.
    pub task_timeout: Duration,
    /// Failed queue pulls tolerated before a worker exits its loop.
    pub max_reconnect_attempts: u32,
    /// Base delay for reconnect backoff.
    pub reconnect_base: Duration,
    /// Ceiling for reconnect backoff.
    pub reconnect_cap: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_poll_timeout: Duration::from_millis(250),
            task_timeout: Duration::from_secs(300),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base: RECONNECT_BASE,
            reconnect_cap: RECONNECT_CAP,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskTicket
// ---------------------------------------------------------------------------

/// Handle to a submitted invocation, resolving to its [`TaskResult`].
#[derive(Debug)]
pub struct TaskTicket {
    invocation_id: InvocationId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskTicket {
    /// The invocation this ticket tracks.
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// Wait for the worker pool to record the result.
    pub async fn wait(self) -> Result<TaskResult> {
        self.rx.await.map_err(|_| {
            PipehubError::QueueConnectivity(
                "worker pool dropped the result slot before recording a result".into(),
            )
        })
    }
}

type ResultSlots = Arc<Mutex<HashMap<InvocationId, oneshot::Sender<TaskResult>>>>;

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A bounded set of concurrent workers executing registered tasks.
pub struct WorkerPool<Q: TaskQueue> {
    queue: Arc<Q>,
    registry: Arc<TaskRegistry>,
    slots: ResultSlots,
    shutdown: CancelFlag,
    submitted: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: WorkerPoolConfig,
}

impl<Q: TaskQueue> WorkerPool<Q> {
    /// Spawn the configured number of workers against a populated registry.
    pub fn start(registry: Arc<TaskRegistry>, queue: Arc<Q>, config: WorkerPoolConfig) -> Self {
        let slots: ResultSlots = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancelFlag::new();

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                queue.clone(),
                registry.clone(),
                slots.clone(),
                shutdown.clone(),
                config.clone(),
            )));
        }

        info!(workers = config.workers, "worker pool started");
        Self {
            queue,
            registry,
            slots,
            shutdown,
            submitted: AtomicUsize::new(0),
            handles: Mutex::new(handles),
            config,
        }
    }

    /// Per-task execution timeout workers enforce.
    pub fn task_timeout(&self) -> Duration {
        self.config.task_timeout
    }

    /// Enqueue an invocation and return a ticket for its result.
    ///
    /// Fails with `UnknownTask` before anything is enqueued when the task
    /// was never registered.
    pub async fn submit(&self, invocation: TaskInvocation) -> Result<TaskTicket> {
        self.registry.lookup(&invocation.task)?;

        let invocation_id = invocation.id;
        let (tx, rx) = oneshot::channel();
        self.slots.lock().await.insert(invocation_id, tx);

        if let Err(e) = self.queue.push(invocation).await {
            self.slots.lock().await.remove(&invocation_id);
            return Err(e);
        }

        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(TaskTicket { invocation_id, rx })
    }

    /// Total invocations accepted by `submit` since startup.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Shutdown flag shared with workers and surfaced to handlers as the
    /// cooperative cancellation context.
    pub fn shutdown_flag(&self) -> CancelFlag {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for all worker loops to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop<Q: TaskQueue>(
    worker_id: usize,
    queue: Arc<Q>,
    registry: Arc<TaskRegistry>,
    slots: ResultSlots,
    shutdown: CancelFlag,
    config: WorkerPoolConfig,
) {
    let mut reconnect_attempts: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match queue.pull(config.queue_poll_timeout).await {
            Ok(Some(invocation)) => {
                reconnect_attempts = 0;
                let result =
                    execute(&registry, invocation, config.task_timeout, &shutdown).await;
                deliver(&slots, result).await;
            }
            Ok(None) => {
                reconnect_attempts = 0;
            }
            Err(e) => {
                reconnect_attempts += 1;
                if reconnect_attempts > config.max_reconnect_attempts {
                    // Fatal for this worker, not for the pool.
                    error!(
                        worker = worker_id,
                        attempts = reconnect_attempts - 1,
                        error = %e,
                        "queue unreachable, worker marking itself unhealthy and exiting"
                    );
                    break;
                }
                let delay =
                    reconnect_delay(reconnect_attempts, config.reconnect_base, config.reconnect_cap);
                warn!(
                    worker = worker_id,
                    attempt = reconnect_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "queue pull failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    debug!(worker = worker_id, "worker loop stopped");
}

/// Execute one invocation, capturing handler failures and timeouts into the
/// result instead of letting them escape the worker.
async fn execute(
    registry: &TaskRegistry,
    invocation: TaskInvocation,
    task_timeout: Duration,
    shutdown: &CancelFlag,
) -> TaskResult {
    let started_at = Utc::now();
    let start = Instant::now();
    let task = invocation.task.clone();
    let invocation_id = invocation.id;

    let definition = match registry.lookup(&task) {
        Ok(definition) => definition,
        Err(e) => {
            // A redelivered invocation for a task this process never
            // registered. Recorded as a failure, not a worker crash.
            return TaskResult {
                invocation_id,
                task,
                status: TaskStatus::Failed,
                output: TaskParams::new(),
                error: Some(e.to_string()),
                duration: start.elapsed(),
                started_at,
                finished_at: Utc::now(),
            };
        }
    };

    let ctx = TaskContext {
        task: task.clone(),
        params: definition.merged_params(&invocation),
        cancelled: shutdown.clone(),
    };

    // The handler runs on its own task so a timeout abandons it rather than
    // blocking the worker; an abandoned handler may still run to completion
    // and its late output goes nowhere.
    let handler = tokio::spawn(definition.execute(ctx));

    let (status, output, error) = match tokio::time::timeout(task_timeout, handler).await {
        Ok(Ok(Ok(output))) => (TaskStatus::Succeeded, output, None),
        Ok(Ok(Err(e))) => (TaskStatus::Failed, TaskParams::new(), Some(e.to_string())),
        Ok(Err(join_error)) => (
            TaskStatus::Failed,
            TaskParams::new(),
            Some(format!("handler panicked: {join_error}")),
        ),
        Err(_) => (
            TaskStatus::TimedOut,
            TaskParams::new(),
            Some(format!("exceeded per-task timeout of {task_timeout:?}")),
        ),
    };

    if status != TaskStatus::Succeeded {
        warn!(task = %task, id = %invocation_id, %status, error = error.as_deref().unwrap_or(""), "task did not succeed");
    }

    TaskResult {
        invocation_id,
        task,
        status,
        output,
        error,
        duration: start.elapsed(),
        started_at,
        finished_at: Utc::now(),
    }
}

/// Hand a result back to its submitter, or discard it when the slot is gone
/// (duplicate redelivery, or a submitter that stopped waiting).
async fn deliver(slots: &ResultSlots, result: TaskResult) {
    let invocation_id = result.invocation_id;
    match slots.lock().await.remove(&invocation_id) {
        Some(tx) => {
            if tx.send(result).is_err() {
                debug!(id = %invocation_id, "submitter gone, result discarded");
            }
        }
        None => {
            debug!(id = %invocation_id, "no result slot (duplicate delivery), result discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipehub_queue::MemoryQueue;
    use pipehub_registry::TaskOutput;
    use serde_json::json;

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            queue_poll_timeout: Duration::from_millis(20),
            task_timeout: Duration::from_secs(5),
            ..WorkerPoolConfig::default()
        }
    }

    fn registry_with_basics() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("ok", TaskParams::new(), |ctx: TaskContext| async move {
                let mut out = TaskOutput::new();
                out.insert("echo".into(), json!(ctx.params.get("msg").cloned()));
                Ok(out)
            })
            .unwrap();
        registry
            .register("boom", TaskParams::new(), |_ctx| async {
                Err(PipehubError::task_execution("boom", "exploded on purpose"))
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn successful_task_records_output() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(registry, queue, test_config());

        let mut params = TaskParams::new();
        params.insert("msg".into(), json!("hello"));
        let ticket = pool
            .submit(TaskInvocation::new("ok", params))
            .await
            .unwrap();

        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert!(result.error.is_none());
        assert_eq!(result.task, "ok");

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failing_handler_is_captured_and_pool_survives() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(registry, queue, test_config());

        let ticket = pool
            .submit(TaskInvocation::new("boom", TaskParams::new()))
            .await
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        let detail = result.error.expect("error detail present");
        assert!(!detail.is_empty());

        // The pool keeps accepting and executing work afterwards.
        let ticket = pool
            .submit(TaskInvocation::new("ok", TaskParams::new()))
            .await
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::Succeeded);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_is_captured() {
        let mut registry = registry_with_basics();
        registry
            .register("panic", TaskParams::new(), |_ctx| async {
                if true {
                    panic!("handler blew up");
                }
                Ok(TaskOutput::new())
            })
            .unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(Arc::new(registry), queue, test_config());

        let ticket = pool
            .submit(TaskInvocation::new("panic", TaskParams::new()))
            .await
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.unwrap().contains("panicked"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut registry = registry_with_basics();
        registry
            .register("slow", TaskParams::new(), |_ctx| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskOutput::new())
            })
            .unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let config = WorkerPoolConfig {
            task_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let pool = WorkerPool::start(Arc::new(registry), queue, config);

        let ticket = pool
            .submit(TaskInvocation::new("slow", TaskParams::new()))
            .await
            .unwrap();
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert!(result.duration < Duration::from_secs(10));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_rejected_at_submit() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(registry, queue.clone(), test_config());

        let err = pool
            .submit(TaskInvocation::new("deploy", TaskParams::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipehubError::UnknownTask { .. }));
        assert_eq!(pool.submitted(), 0);
        assert_eq!(queue.len().await, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_delivery_is_executed_and_discarded() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(registry, queue.clone(), test_config());

        let ticket = pool
            .submit(TaskInvocation::new("ok", TaskParams::new()))
            .await
            .unwrap();
        let original = ticket.wait().await.unwrap();
        assert_eq!(original.status, TaskStatus::Succeeded);

        // Simulate at-least-once redelivery: the same invocation reappears on
        // the queue after its result slot is consumed.
        let mut duplicate = TaskInvocation::new("ok", TaskParams::new());
        duplicate.id = original.invocation_id;
        queue.push(duplicate).await.unwrap();

        // The duplicate's result is silently discarded and the pool stays
        // healthy for new work.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let ticket = pool
            .submit(TaskInvocation::new("ok", TaskParams::new()))
            .await
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap().status, TaskStatus::Succeeded);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_all_workers() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::start(registry, queue, test_config());

        pool.shutdown().await;
        assert!(pool.shutdown_flag().is_cancelled());
    }

    /// Queue wrapper that fails the first `failures` pulls, then delegates.
    struct FlakyQueue {
        inner: MemoryQueue,
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    impl TaskQueue for FlakyQueue {
        async fn push(&self, invocation: TaskInvocation) -> Result<()> {
            self.inner.push(invocation).await
        }

        async fn pull(&self, timeout: Duration) -> Result<Option<TaskInvocation>> {
            if self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PipehubError::QueueConnectivity("connection reset".into()));
            }
            self.inner.pull(timeout).await
        }
    }

    #[tokio::test]
    async fn worker_backs_off_and_recovers_from_queue_errors() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(FlakyQueue {
            inner: MemoryQueue::new(),
            remaining_failures: std::sync::atomic::AtomicU32::new(1),
        });
        let config = WorkerPoolConfig {
            workers: 1,
            ..test_config()
        };
        let pool = WorkerPool::start(registry, queue, config);

        // First pull fails; after one jittered backoff (ceiling 1s) the
        // worker reconnects and drains the queue.
        let ticket = pool
            .submit(TaskInvocation::new("ok", TaskParams::new()))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .expect("worker recovered within backoff window")
            .unwrap();
        assert_eq!(result.status, TaskStatus::Succeeded);

        pool.shutdown().await;
    }

    /// Queue whose pulls always fail; pushes still land on the inner queue.
    struct DeadQueue {
        inner: MemoryQueue,
        pulls: std::sync::atomic::AtomicU32,
    }

    impl TaskQueue for DeadQueue {
        async fn push(&self, invocation: TaskInvocation) -> Result<()> {
            self.inner.push(invocation).await
        }

        async fn pull(&self, _timeout: Duration) -> Result<Option<TaskInvocation>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Err(PipehubError::QueueConnectivity("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn worker_exits_after_exhausting_reconnect_attempts() {
        let registry = Arc::new(registry_with_basics());
        let queue = Arc::new(DeadQueue {
            inner: MemoryQueue::new(),
            pulls: std::sync::atomic::AtomicU32::new(0),
        });
        let config = WorkerPoolConfig {
            max_reconnect_attempts: 2,
            reconnect_base: Duration::from_millis(1),
            reconnect_cap: Duration::from_millis(2),
            ..test_config()
        };
        let pool = WorkerPool::start(registry, queue.clone(), config);

        // Each of the 2 workers fails its 2 tolerated pulls plus the fatal
        // one, then exits its loop; the pull count must settle at 6.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = queue.pulls.load(Ordering::SeqCst);
        assert_eq!(settled, 6);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.pulls.load(Ordering::SeqCst), settled);

        // The pool itself survives its workers: submissions are still
        // accepted and shutdown joins cleanly.
        let _ticket = pool
            .submit(TaskInvocation::new("ok", TaskParams::new()))
            .await
            .unwrap();
        assert_eq!(pool.submitted(), 1);

        pool.shutdown().await;
    }
}
