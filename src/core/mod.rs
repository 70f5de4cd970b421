//! Core data structures: the priority heap, tasks and the task graph.

pub mod dag;
pub mod heap;
pub mod task;

pub use dag::{FailureOutcome, Propagation, Subgraph, Synthesis, TaskGraph};
pub use heap::{FibonacciHeap, Handle, HandleTranslator, HeapStats};
pub use task::{CancelReason, TaskId, TaskKind, TaskNode, TaskState};
