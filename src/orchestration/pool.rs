//! Worker pool for task execution.
//!
//! A fixed number of workers loop on [`Scheduler::next_task`], run the task
//! through the executor and report the outcome back to the engine. Each
//! in-flight execution is tracked as a [`WorkerSlot`] holding its
//! cancellation token.
//!
//! [`Scheduler::next_task`]: crate::orchestration::Scheduler::next_task

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::task::TaskId;
use crate::orchestration::engine::{Engine, TaskEvent};
use crate::orchestration::executor::ExecutionRequest;
use crate::util::join_with_timeout;

/// One in-flight execution.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub task_id: TaskId,
    /// Worker index, `None` for a task running on a remote peer.
    pub worker: Option<usize>,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

/// Active slots indexed by task.
#[derive(Debug)]
pub(crate) struct SlotRegistry {
    slots: Mutex<HashMap<TaskId, WorkerSlot>>,
    root: CancellationToken,
}

impl SlotRegistry {
    pub(crate) fn new(root: CancellationToken) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            root,
        }
    }

    /// Open a slot for `task_id` and return its cancellation token, a child
    /// of the runtime token.
    pub(crate) async fn register(&self, task_id: TaskId, worker: Option<usize>) -> CancellationToken {
        let cancel = self.root.child_token();
        self.slots.lock().await.insert(
            task_id,
            WorkerSlot {
                task_id,
                worker,
                cancel: cancel.clone(),
                started_at: Instant::now(),
            },
        );
        cancel
    }

    /// Signal the execution of `task_id`, if any.
    pub(crate) async fn cancel(&self, task_id: &TaskId) -> bool {
        match self.slots.lock().await.get(task_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn finish(&self, task_id: &TaskId) -> Option<WorkerSlot> {
        self.slots.lock().await.remove(task_id)
    }

    pub(crate) async fn snapshot(&self) -> Vec<WorkerSlot> {
        let mut slots: Vec<WorkerSlot> = self.slots.lock().await.values().cloned().collect();
        slots.sort_by_key(|s| s.started_at);
        slots
    }
}

/// How one execution ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotOutcome {
    Completed(Value),
    Failed(String),
    /// Cancelled and the executor returned within the grace period.
    Cancelled,
    /// Cancelled and the executor kept running past the grace period.
    Unresponsive,
}

/// Run `request` through the engine's executor.
///
/// Honors the per-task timeout and, once the request's token fires, gives
/// the executor the configured grace period before abandoning it.
pub(crate) async fn execute_with_cancel(engine: &Engine, request: ExecutionRequest) -> SlotOutcome {
    let cancel = request.cancel.clone();
    let grace = engine.config.workers.cancel_grace();
    let limit = engine.config.workers.task_timeout();

    let execution = engine.executor.execute(request);
    tokio::pin!(execution);
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    tokio::select! {
        result = &mut execution => {
            return match result {
                Ok(value) => SlotOutcome::Completed(value),
                Err(error) => SlotOutcome::Failed(error),
            };
        }
        _ = &mut deadline => {
            cancel.cancel();
            return SlotOutcome::Failed(format!(
                "execution timed out after {:?}",
                limit.unwrap_or_default()
            ));
        }
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut execution).await {
        Ok(_) => SlotOutcome::Cancelled,
        Err(_) => SlotOutcome::Unresponsive,
    }
}

/// Fixed-size set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers pulling from the engine's scheduler.
    pub(crate) fn spawn(engine: Arc<Engine>, size: usize) -> Self {
        debug!(size, "WorkerPool::spawn");
        let handles = (0..size)
            .map(|index| tokio::spawn(worker_loop(Arc::clone(&engine), index)))
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit, giving up on each after `timeout`.
    pub async fn join(self, timeout: Duration) {
        for handle in self.handles {
            if let Err(e) = join_with_timeout(timeout, handle).await {
                warn!(error = %e, "worker did not stop cleanly");
            }
        }
    }
}

async fn worker_loop(engine: Arc<Engine>, index: usize) {
    while let Some(id) = engine.scheduler.next_task().await {
        let Some(request) = engine.begin(id, index).await else {
            continue;
        };
        debug!(worker = index, task_id = %id, attempt = request.attempt, "executing task");

        let outcome = execute_with_cancel(&engine, request).await;
        engine.slots.finish(&id).await;

        match outcome {
            SlotOutcome::Completed(result) => engine.complete(id, result).await,
            SlotOutcome::Failed(error) => engine.fail(id, error).await,
            SlotOutcome::Cancelled => debug!(task_id = %id, "execution cancelled"),
            SlotOutcome::Unresponsive => {
                warn!(task_id = %id, "executor ignored cancellation, abandoning it");
                engine.emit(TaskEvent::CancellationUnresponsive { task_id: id });
            }
        }
    }
    debug!(worker = index, "worker stopped");
}
