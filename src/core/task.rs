//! Task data model for the task graph.
//!
//! Tasks are the atomic units of work handed to the executor. Each task
//! tracks its lifecycle state, priority inputs, retry count, and the
//! results flowing in from its dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::coordination::ContentHash;
use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Why a task ended up cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum CancelReason {
    /// Cancelled explicitly by a caller.
    Requested,
    /// An upstream task was cancelled.
    DependencyCancelled { dependency: TaskId },
    /// An upstream task failed terminally.
    BlockedByFailedDependency { dependency: TaskId },
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "requested"),
            CancelReason::DependencyCancelled { dependency } => {
                write!(f, "dependency {} cancelled", dependency.short())
            }
            CancelReason::BlockedByFailedDependency { dependency } => {
                write!(f, "blocked by failed dependency {}", dependency.short())
            }
        }
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Ready -> Scheduled -> Running -> {Completed | Failed}`,
/// `Failed -> Pending` on retry, and any unfinished state may move to
/// `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, inputs attached.
    Ready,
    /// Queued in the scheduler or offered to a peer.
    Scheduled,
    /// Being executed locally or by a peer.
    Running,
    /// Finished with a result.
    Completed,
    /// Execution failed.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Will never run.
    Cancelled { reason: CancelReason },
}

impl TaskState {
    fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Completed, _) | (Cancelled { .. }, _) => false,
            (_, Cancelled { .. }) => true,
            (Pending, Ready)
            | (Ready, Scheduled)
            | (Scheduled, Running)
            | (Running, Completed)
            | (Running, Failed { .. })
            | (Failed { .. }, Pending) => true,
            // Synthesis-only nodes finish without being executed.
            (Pending, Completed) | (Pending, Failed { .. }) => true,
            _ => false,
        }
    }

    /// Completed, exhausted failure, or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled { .. }
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Failed { error } => write!(f, "failed: {}", error),
            TaskState::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// How a task produces its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Payload is run by the executor, with dependency results attached.
    #[default]
    Execute,
    /// Result is folded from dependency results by the synthesizer.
    Synthesis,
}

/// A single node in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    pub kind: TaskKind,
    /// Static base priority. Lower runs earlier.
    pub priority: f64,
    /// Last priority computed by the scheduler.
    pub dynamic_priority: Option<f64>,
    pub state: TaskState,
    /// Opaque executor input.
    pub payload: Value,
    /// Dependency results in dependency insertion order, attached when the
    /// task becomes ready.
    pub inputs: Vec<Value>,
    /// Set once on completion.
    pub result: Option<Value>,
    pub retry_count: u32,
    pub deadline: Option<DateTime<Utc>>,
    /// Whether the coordination layer may hand this task to a peer.
    pub delegable: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion order within the owning graph.
    #[serde(default)]
    pub(crate) seq: u64,
}

impl TaskNode {
    /// Create an executable task with the given name and payload.
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            kind: TaskKind::Execute,
            priority: 0.0,
            dynamic_priority: None,
            state: TaskState::Pending,
            payload,
            inputs: Vec::new(),
            result: None,
            retry_count: 0,
            deadline: None,
            delegable: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq: 0,
        }
    }

    /// Create a synthesis-only task that folds its dependency results.
    pub fn synthesis(name: &str) -> Self {
        Self {
            kind: TaskKind::Synthesis,
            ..Self::new(name, Value::Null)
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn delegable(mut self) -> Self {
        self.delegable = true;
        self
    }

    /// Content identifier of the payload, used for peer placement.
    pub fn content_hash(&self) -> ContentHash {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        ContentHash::of(&[self.name.as_bytes(), bytes.as_slice()])
    }

    /// Move to `next`, rejecting illegal lifecycle steps.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskState::Running => self.started_at = Some(Utc::now()),
            TaskState::Completed | TaskState::Failed { .. } => {
                self.completed_at = Some(Utc::now())
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Attach dependency results and mark the task ready.
    pub fn mark_ready(&mut self, inputs: Vec<Value>) -> Result<()> {
        self.transition(TaskState::Ready)?;
        self.inputs = inputs;
        Ok(())
    }

    /// Record the result and mark the task completed.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(TaskState::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(TaskState::Failed {
            error: error.to_string(),
        })
    }

    pub fn cancel(&mut self, reason: CancelReason) -> Result<()> {
        self.transition(TaskState::Cancelled { reason })
    }

    /// Check if the task will never change state again.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}
