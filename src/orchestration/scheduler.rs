//! Ready-task scheduler.
//!
//! The Scheduler owns one Fibonacci heap of ready task ids under a single
//! mutex. Keys combine the dynamic priority with an insertion sequence
//! number so equal priorities pop in FIFO order. Workers block in
//! [`Scheduler::next_task`] until a task is scheduled or the scheduler is
//! closed.
//!
//! Every key in the heap is evaluated at the same reference instant, so
//! keys computed at different times stay comparable. The reference only
//! moves forward in [`Scheduler::refresh`], which re-keys the whole queue.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::core::heap::{FibonacciHeap, Handle, HeapStats};
use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, Result};
use crate::orchestration::priority::{PriorityFunction, PriorityInput};

/// Heap key: dynamic priority, then insertion order.
#[derive(Debug, Clone, Copy)]
pub struct PriorityKey {
    pub priority: f64,
    pub seq: u64,
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityKey {}

/// Priority inputs captured when a task is queued, so it can be re-aged
/// without consulting the task graph.
#[derive(Debug, Clone, Copy)]
struct Queued {
    handle: Handle,
    seq: u64,
    base: f64,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
}

impl Queued {
    fn input(&self, now: DateTime<Utc>) -> PriorityInput {
        PriorityInput::at(self.base, self.created_at, self.deadline, now)
    }
}

struct Inner {
    heap: FibonacciHeap<PriorityKey, TaskId>,
    queued: HashMap<TaskId, Queued>,
    next_seq: u64,
    /// Instant all current keys were computed at.
    reference: DateTime<Utc>,
    closed: bool,
}

impl Inner {
    fn pop(&mut self) -> Option<TaskId> {
        let (key, id) = self.heap.extract_min()?;
        self.queued.remove(&id);
        trace!(task_id = %id, priority = key.priority, "extracted task");
        Some(id)
    }

    /// Move a queued task to `priority`, keeping its sequence number.
    fn rekey(&mut self, id: &TaskId, priority: f64) -> Result<()> {
        let entry = *self.queued.get(id).ok_or(Error::TaskNotFound(*id))?;
        let current = self
            .heap
            .get(entry.handle)
            .map(|(k, _)| *k)
            .ok_or(Error::InvalidHandle)?;
        let key = PriorityKey {
            priority,
            seq: entry.seq,
        };

        match key.cmp(&current) {
            Ordering::Less => self.heap.decrease_key(entry.handle, key)?,
            Ordering::Greater => {
                // No increase-key: remove and reinsert under the same seq.
                let (_, value) = self.heap.delete(entry.handle)?;
                let handle = self.heap.insert(key, value);
                if let Some(q) = self.queued.get_mut(id) {
                    q.handle = handle;
                }
            }
            Ordering::Equal => {}
        }
        Ok(())
    }
}

/// Priority scheduler for ready tasks.
pub struct Scheduler {
    inner: Mutex<Inner>,
    notify: Notify,
    priority_fn: Arc<dyn PriorityFunction>,
}

impl Scheduler {
    /// Create a scheduler using `priority_fn` to compute dynamic priorities.
    pub fn new(priority_fn: Arc<dyn PriorityFunction>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: FibonacciHeap::new(),
                queued: HashMap::new(),
                next_seq: 0,
                reference: Utc::now(),
                closed: false,
            }),
            notify: Notify::new(),
            priority_fn,
        }
    }

    fn compute(&self, input: &PriorityInput) -> f64 {
        self.priority_fn.priority(input)
    }

    /// Queue a ready task and return its dynamic priority.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskExists`] if the task is already queued and
    /// [`Error::ShutDown`] once the scheduler is closed.
    pub async fn schedule(&self, task: &TaskNode) -> Result<f64> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::ShutDown);
        }
        if inner.queued.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }

        let input = PriorityInput::at(
            task.priority,
            task.created_at,
            task.deadline,
            inner.reference,
        );
        let priority = self.compute(&input);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let handle = inner.heap.insert(PriorityKey { priority, seq }, task.id);
        inner.queued.insert(
            task.id,
            Queued {
                handle,
                seq,
                base: task.priority,
                created_at: task.created_at,
                deadline: task.deadline,
            },
        );
        drop(inner);

        debug!(task_id = %task.id, priority, "scheduled task");
        self.notify.notify_one();
        Ok(priority)
    }

    /// Recompute a queued task's priority from its current fields.
    ///
    /// A lower key uses decrease-key; a higher key removes and reinserts
    /// the task, keeping its original position among equal priorities.
    pub async fn reschedule(&self, task: &TaskNode) -> Result<f64> {
        let mut inner = self.inner.lock().await;
        let reference = inner.reference;
        let entry = inner
            .queued
            .get_mut(&task.id)
            .ok_or(Error::TaskNotFound(task.id))?;
        entry.base = task.priority;
        entry.deadline = task.deadline;
        let input = entry.input(reference);

        let priority = self.compute(&input);
        inner.rekey(&task.id, priority)?;
        debug!(task_id = %task.id, priority, "rescheduled task");
        Ok(priority)
    }

    /// Move the reference instant to now and re-age every queued task.
    ///
    /// Returns the new priority of each queued task.
    pub async fn refresh(&self) -> Result<Vec<(TaskId, f64)>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now().max(inner.reference);
        inner.reference = now;
        let updates: Vec<(TaskId, f64)> = inner
            .queued
            .iter()
            .map(|(id, q)| (*id, self.compute(&q.input(now))))
            .collect();
        for (id, priority) in &updates {
            inner.rekey(id, *priority)?;
        }
        trace!(count = updates.len(), "refreshed priorities");
        Ok(updates)
    }

    /// Instant the current keys were computed at.
    pub async fn reference_time(&self) -> DateTime<Utc> {
        self.inner.lock().await.reference
    }

    /// Wait for the highest-priority task.
    ///
    /// Returns `None` once the scheduler is closed. The caller is
    /// responsible for moving the task to `Running`.
    pub async fn next_task(&self) -> Option<TaskId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a schedule between the check and
            // the await is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return None;
                }
                if let Some(id) = inner.pop() {
                    if !inner.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Pop the highest-priority task without waiting.
    pub async fn try_next_task(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        inner.pop()
    }

    /// Drop a queued task. Returns whether it was queued.
    pub async fn remove(&self, id: &TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.queued.remove(id) else {
            return false;
        };
        inner.heap.delete(entry.handle).is_ok()
    }

    /// Release every waiting worker; later calls to `next_task` return
    /// `None` and `schedule` fails.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }

    pub async fn contains(&self, id: &TaskId) -> bool {
        self.inner.lock().await.queued.contains_key(id)
    }

    /// Current dynamic priority of a queued task.
    pub async fn priority_of(&self, id: &TaskId) -> Option<f64> {
        let inner = self.inner.lock().await;
        let entry = inner.queued.get(id)?;
        inner.heap.get(entry.handle).map(|(k, _)| k.priority)
    }

    pub async fn stats(&self) -> HeapStats {
        self.inner.lock().await.heap.stats()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}
