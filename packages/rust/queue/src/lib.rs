//! Durable-queue abstraction feeding the worker pool.
//!
//! The queue contract is at-least-once delivery with FIFO order per
//! consumer: two invocations pulled by different workers may complete in
//! either order, and a redelivered invocation may be executed twice. Neither
//! is "fixed" here — they reflect what real queue backends guarantee, and
//! handlers are expected to be idempotent.
//!
//! [`MemoryQueue`] is the in-process implementation; durable backends plug
//! in behind the same [`TaskQueue`] trait.

pub mod backoff;

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::trace;

use pipehub_shared::{Result, TaskInvocation};

// ---------------------------------------------------------------------------
// TaskQueue trait
// ---------------------------------------------------------------------------

/// Invocation hand-off point between the dispatcher and the worker pool.
///
/// The queue is the single point of mutual exclusion for hand-off. `pull`
/// blocks for at most `timeout` so that workers can observe shutdown between
/// polls. Errors from either method signal connectivity loss; workers retry
/// with backoff.
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueue an invocation.
    fn push(&self, invocation: TaskInvocation) -> impl Future<Output = Result<()>> + Send;

    /// Pull the next invocation, waiting up to `timeout`. Returns `None`
    /// when the queue stayed empty for the whole wait.
    fn pull(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<TaskInvocation>>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// In-process FIFO queue backed by a mutex-guarded deque.
///
/// Used by the CLI and in tests. Provides the same visible semantics as a
/// durable backend minus persistence: FIFO per consumer, no dedup by
/// invocation id.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<TaskInvocation>>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued invocations.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

impl TaskQueue for MemoryQueue {
    async fn push(&self, invocation: TaskInvocation) -> Result<()> {
        trace!(id = %invocation.id, task = %invocation.task, "queue push");
        self.items.lock().await.push_back(invocation);
        self.notify.notify_one();
        Ok(())
    }

    async fn pull(&self, timeout: Duration) -> Result<Option<TaskInvocation>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(invocation) = self.items.lock().await.pop_front() {
                trace!(id = %invocation.id, "queue pull");
                return Ok(Some(invocation));
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                // Timed out waiting; one final pop covers a push that raced
                // the notification.
                return Ok(self.items.lock().await.pop_front());
            }
        }
    }
}
