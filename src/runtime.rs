//! Caller-facing runtime.
//!
//! A [`TaskNet`] bundles one task graph, one scheduler, a worker pool and an
//! optional coordinator. Instances are independent, so a process (or a test)
//! can run several side by side.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tasknet::{CollectSynthesizer, Config, FnExecutor, TaskGraph, TaskNet, TaskNode};
//!
//! let executor = FnExecutor::new(|req| async move { Ok(req.payload) });
//! let net = TaskNet::builder(Config::default(), Arc::new(executor), Arc::new(CollectSynthesizer))
//!     .start()?;
//!
//! let mut graph = TaskGraph::new();
//! graph.add_task(TaskNode::new("hello", serde_json::json!("world")));
//! let root = net.submit(graph).await?;
//! let result = net.wait(root).await?;
//! net.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordination::{Coordinator, CoordinatorHandle, Envelope, PeerId};
use crate::core::dag::{Subgraph, TaskGraph};
use crate::core::task::{CancelReason, TaskId, TaskNode, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::engine::{Engine, TaskEvent};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::{
    Executable, PriorityFunction, Scheduler, Synthesizer, WeightedPriority, WorkerSlot,
};
use crate::util::join_with_timeout;

/// What `result` reports for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Not finished yet, including tasks waiting out a retry backoff.
    Pending,
    Completed(Value),
    Failed(String),
    Cancelled(CancelReason),
}

impl TaskResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskResult::Pending)
    }

    /// The task's value, or the error that ended it.
    ///
    /// Returns `Ok(None)` while the task is still pending.
    pub fn into_value(self, task: TaskId) -> Result<Option<Value>> {
        match self {
            TaskResult::Pending => Ok(None),
            TaskResult::Completed(value) => Ok(Some(value)),
            TaskResult::Failed(error) => Err(Error::ExecutionFailed { task, error }),
            TaskResult::Cancelled(CancelReason::BlockedByFailedDependency { dependency }) => {
                Err(Error::BlockedByFailedDependency { task, dependency })
            }
            TaskResult::Cancelled(reason) => Err(Error::Cancelled { task, reason }),
        }
    }

    fn from_task(task: &TaskNode) -> Self {
        match &task.state {
            TaskState::Completed => TaskResult::Completed(task.result.clone().unwrap_or(Value::Null)),
            TaskState::Failed { error } => TaskResult::Failed(error.clone()),
            TaskState::Cancelled { reason } => TaskResult::Cancelled(reason.clone()),
            _ => TaskResult::Pending,
        }
    }
}

/// Configures and starts a [`TaskNet`].
pub struct TaskNetBuilder {
    config: Config,
    executor: Arc<dyn Executable>,
    synthesizer: Arc<dyn Synthesizer>,
    priority_fn: Option<Arc<dyn PriorityFunction>>,
    coordinator: Option<(Coordinator, mpsc::Receiver<Envelope>)>,
}

impl TaskNetBuilder {
    /// Replace the default [`WeightedPriority`].
    pub fn with_priority_fn(mut self, priority_fn: Arc<dyn PriorityFunction>) -> Self {
        self.priority_fn = Some(priority_fn);
        self
    }

    /// Attach a coordinator so delegable tasks may run on peers, and tasks
    /// offered by peers may run here.
    ///
    /// # Arguments
    ///
    /// * `coordinator` - Coordination state for the local peer
    /// * `inbound` - Envelopes the transport delivers to the local peer
    pub fn with_coordinator(
        mut self,
        coordinator: Coordinator,
        inbound: mpsc::Receiver<Envelope>,
    ) -> Self {
        self.coordinator = Some((coordinator, inbound));
        self
    }

    /// Validate the configuration and spawn workers, the aging loop and the
    /// coordinator. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<TaskNet> {
        self.config.validate()?;
        let cancel = CancellationToken::new();
        let priority_fn = self
            .priority_fn
            .unwrap_or_else(|| Arc::new(WeightedPriority::from_config(&self.config.priority)));

        let mut background = Vec::new();
        let (coordinator, incoming_rx) = match self.coordinator {
            Some((coordinator, inbound)) => {
                let capacity = self.config.coordination.accept_capacity + 1;
                let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
                let handle = coordinator.spawn(inbound, incoming_tx, cancel.child_token());
                (Some(handle), Some(incoming_rx))
            }
            None => (None, None),
        };

        let pool_size = self.config.workers.pool_size;
        let engine = Arc::new(Engine::new(
            self.config,
            Scheduler::new(priority_fn),
            self.executor,
            self.synthesizer,
            coordinator,
            cancel,
        ));

        let workers = WorkerPool::spawn(Arc::clone(&engine), pool_size);
        background.push(tokio::spawn(aging_loop(Arc::clone(&engine))));
        if let Some(rx) = incoming_rx {
            background.push(tokio::spawn(hosting_loop(Arc::clone(&engine), rx)));
        }

        info!(workers = pool_size, "TaskNet started");
        Ok(TaskNet {
            engine,
            workers: Mutex::new(Some(workers)),
            background: Mutex::new(background),
        })
    }
}

/// A running task network.
pub struct TaskNet {
    engine: Arc<Engine>,
    workers: Mutex<Option<WorkerPool>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskNet {
    pub fn builder(
        config: Config,
        executor: Arc<dyn Executable>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> TaskNetBuilder {
        TaskNetBuilder {
            config,
            executor,
            synthesizer,
            priority_fn: None,
            coordinator: None,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.engine.cancel.is_cancelled() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Merge `graph` into the live graph and start its ready tasks.
    ///
    /// Returns the graph's root, either designated with
    /// [`TaskGraph::set_root`] or its single sink. Execution failures never
    /// surface here; they are reported by [`TaskNet::status`] and
    /// [`TaskNet::result`].
    pub async fn submit(&self, graph: TaskGraph) -> Result<TaskId> {
        self.ensure_running()?;
        self.engine.submit(graph).await
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskState> {
        Ok(self.task(id).await?.state)
    }

    pub async fn result(&self, id: TaskId) -> Result<TaskResult> {
        Ok(TaskResult::from_task(&self.task(id).await?))
    }

    /// Snapshot of a task. Ids of decomposed tasks resolve to the task that
    /// replaced them when the replacement had a single exit.
    pub async fn task(&self, id: TaskId) -> Result<TaskNode> {
        let graph = self.engine.graph.read().await;
        let id = graph.resolve(&id);
        graph.get_task(&id).cloned().ok_or(Error::TaskNotFound(id))
    }

    pub async fn dependencies(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let graph = self.engine.graph.read().await;
        let id = graph.resolve(&id);
        if !graph.contains_task(&id) {
            return Err(Error::TaskNotFound(id));
        }
        Ok(graph.dependencies(&id))
    }

    pub async fn dependents(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let graph = self.engine.graph.read().await;
        let id = graph.resolve(&id);
        if !graph.contains_task(&id) {
            return Err(Error::TaskNotFound(id));
        }
        Ok(graph.dependents(&id))
    }

    /// Cancel a task and every unfinished task depending on it.
    ///
    /// Returns the ids that moved to `Cancelled`; empty if the task had
    /// already finished.
    pub async fn cancel(&self, id: TaskId) -> Result<Vec<TaskId>> {
        self.engine.cancel_task(id).await
    }

    /// Replace a task that has not started running with `sub`.
    pub async fn decompose(&self, id: TaskId, sub: Subgraph) -> Result<()> {
        self.ensure_running()?;
        self.engine.decompose(id, sub).await
    }

    /// Wait until the task finishes.
    pub async fn wait(&self, id: TaskId) -> Result<TaskResult> {
        let mut changed = self.engine.watch();
        loop {
            let result = self.result(id).await?;
            if !result.is_pending() {
                return Ok(result);
            }
            if self.engine.cancel.is_cancelled() {
                return Err(Error::ShutDown);
            }
            tokio::select! {
                res = changed.changed() => res.map_err(|_| Error::ShutDown)?,
                _ = self.engine.cancel.cancelled() => return Err(Error::ShutDown),
            }
        }
    }

    /// Wait for the task and return its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutionFailed`] if the task failed terminally,
    /// [`Error::BlockedByFailedDependency`] if an upstream failure cancelled
    /// it and [`Error::Cancelled`] for any other cancellation.
    pub async fn output(&self, id: TaskId) -> Result<Value> {
        let result = self.wait(id).await?;
        result.into_value(id)?.ok_or(Error::TaskNotFound(id))
    }

    /// [`TaskNet::wait`] bounded by `timeout`.
    pub async fn wait_timeout(&self, id: TaskId, timeout: Duration) -> Result<TaskResult> {
        crate::util::with_timeout(timeout, self.wait(id)).await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.engine.subscribe()
    }

    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        self.engine.coordinator.as_ref()
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.engine.coordinator.as_ref().map(|c| c.local())
    }

    /// Executions currently in flight, oldest first.
    pub async fn running(&self) -> Vec<WorkerSlot> {
        self.engine.slots.snapshot().await
    }

    pub async fn queued(&self) -> usize {
        self.engine.scheduler.len().await
    }

    /// Stop workers and background loops.
    ///
    /// In-flight executions are signalled and given the cancellation grace
    /// period. Unfinished tasks keep their last state.
    pub async fn shutdown(&self) {
        if self.engine.cancel.is_cancelled() {
            return;
        }
        info!("TaskNet shutting down");
        self.engine.cancel.cancel();
        self.engine.scheduler.close().await;

        let wait = self.engine.config.workers.cancel_grace() + Duration::from_secs(1);
        if let Some(workers) = self.workers.lock().await.take() {
            workers.join(wait).await;
        }
        for handle in self.background.lock().await.drain(..) {
            if let Err(e) = join_with_timeout(wait, handle).await {
                warn!(error = %e, "background task did not stop cleanly");
            }
        }
        debug!("TaskNet stopped");
    }
}

impl Drop for TaskNet {
    fn drop(&mut self) {
        self.engine.cancel.cancel();
    }
}

async fn aging_loop(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.workers.aging_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = engine.refresh_priorities().await {
                    warn!(error = %e, "priority refresh failed");
                }
            }
        }
    }
}

async fn hosting_loop(engine: Arc<Engine>, mut incoming: mpsc::Receiver<crate::coordination::IncomingDelegation>) {
    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => break,
            delegation = incoming.recv() => match delegation {
                Some(delegation) => {
                    tokio::spawn(Arc::clone(&engine).host(delegation));
                }
                None => break,
            },
        }
    }
}
