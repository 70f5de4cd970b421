//! Shared execution state.
//!
//! The Engine owns the task graph, the scheduler and the slot registry, and
//! implements every lifecycle step that touches more than one of them:
//! dispatching ready tasks, recording completions and failures, retries,
//! cancellation and decomposition.
//!
//! Lock order: the graph lock may be held while taking the slot registry
//! lock, never the scheduler lock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordination::{
    ClockEvent, CoordinatorHandle, DelegatedTask, IncomingDelegation, PeerId, Placement,
    TaskOutcome,
};
use crate::core::dag::{FailureOutcome, Propagation, Subgraph, TaskGraph};
use crate::core::task::{CancelReason, TaskId, TaskNode, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::executor::{Executable, ExecutionRequest, Synthesizer};
use crate::orchestration::pool::{execute_with_cancel, SlotOutcome, SlotRegistry};
use crate::orchestration::scheduler::Scheduler;

/// Lifecycle notifications.
///
/// Subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Submitted {
        root: TaskId,
        tasks: usize,
    },
    Ready {
        task_id: TaskId,
    },
    Scheduled {
        task_id: TaskId,
        priority: f64,
    },
    Started {
        task_id: TaskId,
        attempt: u32,
    },
    Completed {
        task_id: TaskId,
    },
    Failed {
        task_id: TaskId,
        error: String,
    },
    Retrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },
    Cancelled {
        task_id: TaskId,
        reason: CancelReason,
    },
    /// The executor ignored cancellation past the grace period and was
    /// abandoned.
    CancellationUnresponsive {
        task_id: TaskId,
    },
    Delegated {
        task_id: TaskId,
        peer: PeerId,
    },
    /// Delegation failed and the task was scheduled locally.
    DelegationFallback {
        task_id: TaskId,
        error: String,
    },
    /// A task delegated by `from` was run here.
    Hosted {
        task_id: TaskId,
        from: PeerId,
    },
    Decomposed {
        task_id: TaskId,
        replacement: Vec<TaskId>,
    },
}

pub(crate) struct Engine {
    pub(crate) config: Config,
    pub(crate) graph: RwLock<TaskGraph>,
    pub(crate) scheduler: Scheduler,
    pub(crate) slots: SlotRegistry,
    pub(crate) executor: Arc<dyn Executable>,
    synthesizer: Arc<dyn Synthesizer>,
    pub(crate) coordinator: Option<CoordinatorHandle>,
    events: broadcast::Sender<TaskEvent>,
    changed: watch::Sender<u64>,
    pub(crate) cancel: CancellationToken,
}

impl Engine {
    pub(crate) fn new(
        config: Config,
        scheduler: Scheduler,
        executor: Arc<dyn Executable>,
        synthesizer: Arc<dyn Synthesizer>,
        coordinator: Option<CoordinatorHandle>,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (changed, _) = watch::channel(0);
        Self {
            config,
            graph: RwLock::new(TaskGraph::new()),
            scheduler,
            slots: SlotRegistry::new(cancel.clone()),
            executor,
            synthesizer,
            coordinator,
            events,
            changed,
            cancel,
        }
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    async fn record(&self, event: ClockEvent) {
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.record(event).await {
                debug!(error = %e, "clock event not recorded");
            }
        }
    }

    // ========== Submission ==========

    pub(crate) async fn submit(self: &Arc<Self>, mut graph: TaskGraph) -> Result<TaskId> {
        let root = graph.resolve_root()?;
        let tasks = graph.task_count();

        let propagation = {
            let mut live = self.graph.write().await;
            live.absorb(graph)?;
            let seeds = live.ready_tasks();
            live.propagate(seeds, self.synthesizer.as_ref())?
        };

        info!(root = %root, tasks, "submitted graph");
        self.emit(TaskEvent::Submitted { root, tasks });
        self.after_propagation(propagation).await;
        Ok(root)
    }

    /// Announce what a propagation changed and dispatch newly ready tasks.
    async fn after_propagation(self: &Arc<Self>, propagation: Propagation) {
        for id in &propagation.completed {
            self.emit(TaskEvent::Completed { task_id: *id });
            self.record(ClockEvent::TaskCompleted { task: *id }).await;
        }
        for id in &propagation.failed {
            let error = self.failure_message(id).await;
            error!(task_id = %id, error = %error, "synthesis failed");
            self.emit(TaskEvent::Failed {
                task_id: *id,
                error,
            });
        }
        self.announce_cancelled(&propagation.cancelled).await;
        for id in propagation.ready {
            self.emit(TaskEvent::Ready { task_id: id });
            self.dispatch(id).await;
        }
        self.bump();
    }

    async fn failure_message(&self, id: &TaskId) -> String {
        match self.graph.read().await.get_task(id).map(|t| &t.state) {
            Some(TaskState::Failed { error }) => error.clone(),
            _ => String::new(),
        }
    }

    async fn announce_cancelled(&self, ids: &[TaskId]) {
        for id in ids {
            self.scheduler.remove(id).await;
            let reason = match self.graph.read().await.get_task(id).map(|t| &t.state) {
                Some(TaskState::Cancelled { reason }) => reason.clone(),
                _ => CancelReason::Requested,
            };
            self.emit(TaskEvent::Cancelled {
                task_id: *id,
                reason,
            });
        }
    }

    // ========== Dispatch ==========

    /// Move a ready task to `Scheduled` and hand it to the scheduler or,
    /// when it is delegable and a coordinator is attached, to a peer.
    async fn dispatch(self: &Arc<Self>, id: TaskId) {
        let task = {
            let mut graph = self.graph.write().await;
            let Some(task) = graph.get_task_mut(&id) else {
                return;
            };
            if task.state != TaskState::Ready || task.transition(TaskState::Scheduled).is_err() {
                return;
            }
            task.clone()
        };

        match (&self.coordinator, task.delegable) {
            (Some(coordinator), true) => {
                let engine = Arc::clone(self);
                let coordinator = coordinator.clone();
                tokio::spawn(engine.delegate(task, coordinator));
            }
            _ => self.schedule_local(&task).await,
        }
    }

    async fn schedule_local(&self, task: &TaskNode) {
        let still_scheduled = self
            .graph
            .read()
            .await
            .get_task(&task.id)
            .map(|t| t.state == TaskState::Scheduled)
            .unwrap_or(false);
        if !still_scheduled {
            return;
        }

        match self.scheduler.schedule(task).await {
            Ok(priority) => {
                if let Some(t) = self.graph.write().await.get_task_mut(&task.id) {
                    t.dynamic_priority = Some(priority);
                }
                self.emit(TaskEvent::Scheduled {
                    task_id: task.id,
                    priority,
                });
                self.record(ClockEvent::TaskScheduled { task: task.id }).await;
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "could not schedule task"),
        }
    }

    /// Re-age the ready queue and copy the new keys onto the task nodes.
    pub async fn refresh_priorities(&self) -> Result<usize> {
        let updates = self.scheduler.refresh().await?;
        let mut graph = self.graph.write().await;
        for (id, priority) in &updates {
            if let Some(t) = graph.get_task_mut(id) {
                t.dynamic_priority = Some(*priority);
            }
        }
        Ok(updates.len())
    }

    // Boxed because the delegation outcome re-enters dispatch.
    fn delegate(
        self: Arc<Self>,
        task: TaskNode,
        coordinator: CoordinatorHandle,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run_delegation(task, coordinator).await })
    }

    async fn run_delegation(self: Arc<Self>, task: TaskNode, coordinator: CoordinatorHandle) {
        let peer = match coordinator.place(task.content_hash()).await {
            Ok(Placement::Delegate(peer)) => peer,
            Ok(Placement::Local) => {
                self.schedule_local(&task).await;
                return;
            }
            Err(e) => {
                self.fall_back(&task, e).await;
                return;
            }
        };

        let pending = match coordinator
            .delegate(peer, DelegatedTask::from_node(&task))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.fall_back(&task, e).await;
                return;
            }
        };

        let token = {
            let mut graph = self.graph.write().await;
            match graph.transition(&task.id, TaskState::Running) {
                Ok(()) => self.slots.register(task.id, None).await,
                // Cancelled or decomposed while the offer was in flight.
                Err(_) => return,
            }
        };
        info!(task_id = %task.id, peer = %peer.short(), "delegated task");
        self.emit(TaskEvent::Delegated {
            task_id: task.id,
            peer,
        });
        self.record(ClockEvent::TaskDelegated {
            task: task.id,
            peer,
        })
        .await;

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            outcome = pending.outcome() => Some(outcome),
        };
        self.slots.finish(&task.id).await;

        match outcome {
            None => debug!(task_id = %task.id, "stopped waiting for delegated result"),
            Some(Ok(TaskOutcome::Completed { result })) => self.complete(task.id, result).await,
            Some(Ok(TaskOutcome::Failed { error })) => self.fail(task.id, error).await,
            Some(Err(e)) => self.fail(task.id, e.to_string()).await,
        }
    }

    async fn fall_back(&self, task: &TaskNode, error: Error) {
        warn!(task_id = %task.id, error = %error, "delegation failed, running locally");
        self.emit(TaskEvent::DelegationFallback {
            task_id: task.id,
            error: error.to_string(),
        });
        self.schedule_local(task).await;
    }

    // ========== Execution results ==========

    /// Move a popped task to `Running` and register its worker slot.
    ///
    /// Returns `None` if the task was cancelled or decomposed after being
    /// queued.
    pub(crate) async fn begin(&self, id: TaskId, worker: usize) -> Option<ExecutionRequest> {
        let mut graph = self.graph.write().await;
        let task = graph.get_task_mut(&id)?;
        if task.state != TaskState::Scheduled {
            debug!(task_id = %id, state = %task.state, "skipping stale queue entry");
            return None;
        }
        task.transition(TaskState::Running).ok()?;
        let (name, payload, inputs, attempt) = (
            task.name.clone(),
            task.payload.clone(),
            task.inputs.clone(),
            task.retry_count,
        );
        let cancel = self.slots.register(id, Some(worker)).await;
        drop(graph);

        self.emit(TaskEvent::Started {
            task_id: id,
            attempt,
        });
        Some(ExecutionRequest {
            task_id: id,
            name,
            payload,
            inputs,
            attempt,
            cancel,
        })
    }

    /// Store a result and release dependents.
    pub(crate) async fn complete(self: &Arc<Self>, id: TaskId, result: Value) {
        let propagation = {
            let mut graph = self.graph.write().await;
            let unblocked = match graph.complete_task(&id, result) {
                Ok(unblocked) => unblocked,
                Err(e) => {
                    debug!(task_id = %id, error = %e, "dropping result");
                    return;
                }
            };
            match graph.propagate(unblocked, self.synthesizer.as_ref()) {
                Ok(p) => p,
                Err(e) => {
                    error!(task_id = %id, error = %e, "propagation failed");
                    Propagation::default()
                }
            }
        };

        info!(task_id = %id, "task completed");
        self.emit(TaskEvent::Completed { task_id: id });
        self.record(ClockEvent::TaskCompleted { task: id }).await;
        self.after_propagation(propagation).await;
    }

    /// Record a failed attempt and either retry after backoff or fail the
    /// task terminally.
    pub(crate) async fn fail(self: &Arc<Self>, id: TaskId, error: String) {
        let max_retries = self.config.retry.max_retries;
        let outcome = match self.graph.write().await.fail_task(&id, &error, max_retries) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(task_id = %id, error = %e, "dropping failure");
                return;
            }
        };

        match outcome {
            FailureOutcome::Retry { attempt } => {
                let delay = self.config.retry.backoff(attempt);
                warn!(task_id = %id, attempt, ?delay, error = %error, "task failed, retrying");
                self.emit(TaskEvent::Retrying {
                    task_id: id,
                    attempt,
                    delay,
                });
                let engine = Arc::clone(self);
                tokio::spawn(engine.retry_after(id, delay));
            }
            FailureOutcome::Exhausted { cancelled } => {
                error!(task_id = %id, error = %error, "task failed");
                self.emit(TaskEvent::Failed { task_id: id, error });
                self.announce_cancelled(&cancelled).await;
            }
        }
        self.bump();
    }

    fn retry_after(self: Arc<Self>, id: TaskId, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let requeued = self.graph.write().await.requeue(&id);
            match requeued {
                Ok(true) => {
                    self.emit(TaskEvent::Ready { task_id: id });
                    self.dispatch(id).await;
                }
                Ok(false) => debug!(task_id = %id, "cancelled during backoff"),
                Err(e) => debug!(task_id = %id, error = %e, "retry dropped"),
            }
        })
    }

    // ========== Caller operations ==========

    /// Cancel a task and its unfinished dependents.
    ///
    /// Graph state changes synchronously; running executions are signalled
    /// through their cancellation tokens.
    pub(crate) async fn cancel_task(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let cancelled = {
            let mut graph = self.graph.write().await;
            let id = graph.resolve(&id);
            let cancelled = graph.cancel(&id, CancelReason::Requested)?;
            for c in &cancelled {
                self.slots.cancel(c).await;
            }
            cancelled
        };
        self.announce_cancelled(&cancelled).await;
        self.bump();
        Ok(cancelled)
    }

    pub(crate) async fn decompose(self: &Arc<Self>, id: TaskId, sub: Subgraph) -> Result<()> {
        let replacement: Vec<TaskId> = sub.tasks.iter().map(|t| t.id).collect();
        let propagation = {
            let mut graph = self.graph.write().await;
            graph.decompose(&id, sub)?;
            let seeds = graph.ready_tasks();
            graph.propagate(seeds, self.synthesizer.as_ref())?
        };
        self.scheduler.remove(&id).await;

        self.emit(TaskEvent::Decomposed {
            task_id: id,
            replacement,
        });
        self.after_propagation(propagation).await;
        Ok(())
    }

    // ========== Hosting ==========

    /// Run a task delegated by a remote peer and send back its outcome.
    pub(crate) async fn host(self: Arc<Self>, delegation: IncomingDelegation) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let task = &delegation.task;
        let request = ExecutionRequest {
            task_id: task.task_id,
            name: task.name.clone(),
            payload: task.payload.clone(),
            inputs: task.inputs.clone(),
            attempt: task.attempt,
            cancel: self.cancel.child_token(),
        };

        let outcome = match execute_with_cancel(&self, request).await {
            SlotOutcome::Completed(result) => TaskOutcome::Completed { result },
            SlotOutcome::Failed(error) => TaskOutcome::Failed { error },
            SlotOutcome::Cancelled | SlotOutcome::Unresponsive => TaskOutcome::Failed {
                error: "host shutting down".to_string(),
            },
        };

        if let Err(e) = coordinator
            .respond(delegation.from, delegation.offer_id, outcome)
            .await
        {
            debug!(error = %e, "could not return hosted result");
        }
        self.emit(TaskEvent::Hosted {
            task_id: task.task_id,
            from: delegation.from,
        });
        self.record(ClockEvent::TaskHosted {
            task: task.task_id,
            from: delegation.from,
        })
        .await;
    }
}
