//! Scheduling and execution.
//!
//! Ready tasks are queued by the [`Scheduler`] under a pluggable
//! [`PriorityFunction`], pulled by the worker pool and run through the
//! [`Executable`] supplied by the embedding application.

pub(crate) mod engine;
mod executor;
pub(crate) mod pool;
mod priority;
mod scheduler;

pub use engine::TaskEvent;
pub use executor::{CollectSynthesizer, Executable, ExecutionRequest, FnExecutor, Synthesizer};
pub use pool::{WorkerPool, WorkerSlot};
pub use priority::{PriorityFunction, PriorityInput, StaticPriority, WeightedPriority};
pub use scheduler::{PriorityKey, Scheduler};
