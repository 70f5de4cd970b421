//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A recording executor with a gate for holding tasks in `Running`
//! - Fast test configuration
//! - Polling for task state

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use tasknet::core::task::{TaskId, TaskState};
use tasknet::{CollectSynthesizer, Config, Executable, ExecutionRequest, TaskNet};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Executor that records every invocation.
///
/// Tasks whose name starts with `gate` block until [`Recorder::release`]
/// is called or they are cancelled. Names registered with
/// [`Recorder::fail_times`] fail that many times before succeeding.
pub struct Recorder {
    label: String,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, u32>>,
    gate: Semaphore,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Self::labelled("local")
    }

    /// Results carry `label` under `"by"` so tests can tell peers apart.
    pub fn labelled(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn fail_times(&self, name: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
    }

    /// Let one gated task through.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    /// The value a successful run of `name` with `inputs` produces.
    pub fn output(&self, name: &str, inputs: Vec<Value>) -> Value {
        json!({ "name": name, "by": self.label, "inputs": inputs })
    }
}

#[async_trait]
impl Executable for Recorder {
    async fn execute(&self, request: ExecutionRequest) -> Result<Value, String> {
        self.calls.lock().unwrap().push(request.name.clone());

        if request.name.starts_with("gate") {
            tokio::select! {
                permit = self.gate.acquire() => {
                    permit.map_err(|e| e.to_string())?.forget();
                }
                _ = request.cancel.cancelled() => return Err("cancelled".to_string()),
            }
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&request.name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(format!("transient failure of {}", request.name));
                }
            }
        }

        Ok(self.output(&request.name, request.inputs))
    }
}

/// Defaults with short delays so retries and gossip settle quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.pool_size = 2;
    config.workers.cancel_grace_ms = 200;
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 10;
    config.coordination.gossip_interval_ms = 20;
    config.coordination.offer_timeout_ms = 200;
    config.coordination.result_timeout_ms = 2_000;
    config
}

pub fn start(config: Config, recorder: Arc<Recorder>) -> TaskNet {
    TaskNet::builder(config, recorder, Arc::new(CollectSynthesizer))
        .start()
        .expect("start TaskNet")
}

/// Poll until `id` reaches a state matching `pred`.
pub async fn wait_for_state(net: &TaskNet, id: TaskId, pred: impl Fn(&TaskState) -> bool) -> TaskState {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let state = net.status(id).await.expect("task exists");
        if pred(&state) {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `cond` holds.
pub async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
