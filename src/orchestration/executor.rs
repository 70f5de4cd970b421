//! Capability traits for the collaborators that do the actual work.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::task::TaskId;

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub name: String,
    pub payload: Value,
    /// Dependency results in dependency insertion order.
    pub inputs: Vec<Value>,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Cancelled when the task is cancelled or the runtime shuts down.
    pub cancel: CancellationToken,
}

/// Runs task payloads.
///
/// Implementations should return promptly once `request.cancel` fires.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> std::result::Result<Value, String>;
}

/// Adapts an async closure into an [`Executable`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Executable for FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send,
{
    async fn execute(&self, request: ExecutionRequest) -> std::result::Result<Value, String> {
        (self.f)(request).await
    }
}

/// Folds the ordered results of a node's dependencies into its result.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, task: TaskId, inputs: &[Value]) -> std::result::Result<Value, String>;
}

/// Returns the dependency results as a JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectSynthesizer;

impl Synthesizer for CollectSynthesizer {
    fn synthesize(&self, _task: TaskId, inputs: &[Value]) -> std::result::Result<Value, String> {
        Ok(Value::Array(inputs.to_vec()))
    }
}
