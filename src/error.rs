use thiserror::Error;

use crate::coordination::PeerId;
use crate::core::task::{CancelReason, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Adding dependency from {from} to {to} would create a cycle")]
    CycleDetected { from: TaskId, to: TaskId },

    #[error("New key must be strictly smaller than the current key")]
    InvalidKeyOrder,

    #[error("Heap handle is stale or belongs to another heap")]
    InvalidHandle,

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Delegation to {peer} rejected: {reason}")]
    DelegationRejected { peer: PeerId, reason: String },

    #[error("Delegation to {peer} timed out after {timeout:?}")]
    DelegationTimeout {
        peer: PeerId,
        timeout: std::time::Duration,
    },

    #[error("Task {task} failed: {error}")]
    ExecutionFailed { task: TaskId, error: String },

    #[error("Task {task} blocked by failed dependency {dependency}")]
    BlockedByFailedDependency { task: TaskId, dependency: TaskId },

    #[error("Task {task} cancelled: {reason}")]
    Cancelled { task: TaskId, reason: CancelReason },

    #[error("Invalid clock entry: {0}")]
    InvalidClockEntry(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("TaskNet has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;
