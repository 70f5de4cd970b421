//! Distributed task orchestration.
//!
//! Tasks form a dependency graph. Ready tasks are ordered by a Fibonacci heap
//! keyed on a dynamic priority and run by a bounded worker pool; peers share
//! causal history through a Merkle clock and hand work to each other by
//! Hamming-distance placement.

pub mod config;
pub mod coordination;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod runtime;
pub mod util;

pub use config::Config;
pub use coordination::{Coordinator, CoordinatorHandle, LocalNetwork, PeerId};
pub use self::core::{FibonacciHeap, Subgraph, TaskGraph, TaskId, TaskNode, TaskState};
pub use error::{Error, Result};
pub use orchestration::{
    CollectSynthesizer, Executable, ExecutionRequest, FnExecutor, PriorityFunction, Synthesizer,
    TaskEvent, WeightedPriority,
};
pub use runtime::{TaskNet, TaskNetBuilder, TaskResult};
