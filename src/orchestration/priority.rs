//! Dynamic priority functions.
//!
//! Keys are "lower runs earlier". A priority function must not increase
//! the key as a task ages or as its deadline approaches.

use chrono::{DateTime, Utc};

use crate::config::PriorityConfig;

/// Inputs a priority function may look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInput {
    /// Static base priority of the task.
    pub base: f64,
    /// Seconds since the task was created.
    pub age_secs: f64,
    /// Seconds until the deadline, negative once overdue.
    pub slack_secs: Option<f64>,
}

impl PriorityInput {
    pub fn at(
        base: f64,
        created_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let secs = |d: chrono::Duration| d.num_milliseconds() as f64 / 1000.0;
        Self {
            base,
            age_secs: secs(now - created_at).max(0.0),
            slack_secs: deadline.map(|d| secs(d - now)),
        }
    }
}

/// Computes a task's dynamic priority key.
pub trait PriorityFunction: Send + Sync {
    fn priority(&self, input: &PriorityInput) -> f64;
}

/// Uses the static priority unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPriority;

impl PriorityFunction for StaticPriority {
    fn priority(&self, input: &PriorityInput) -> f64 {
        input.base
    }
}

/// `base - age_weight * age + deadline_weight * min(slack, horizon) / horizon`
///
/// A task without a deadline is treated as having a full horizon of slack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedPriority {
    pub age_weight: f64,
    pub deadline_weight: f64,
    pub deadline_horizon_secs: f64,
}

impl WeightedPriority {
    pub fn from_config(config: &PriorityConfig) -> Self {
        Self {
            age_weight: config.age_weight,
            deadline_weight: config.deadline_weight,
            deadline_horizon_secs: config.deadline_horizon_secs,
        }
    }
}

impl Default for WeightedPriority {
    fn default() -> Self {
        Self::from_config(&PriorityConfig::default())
    }
}

impl PriorityFunction for WeightedPriority {
    fn priority(&self, input: &PriorityInput) -> f64 {
        let horizon = self.deadline_horizon_secs.max(f64::EPSILON);
        let slack = input.slack_secs.unwrap_or(horizon).min(horizon);
        input.base - self.age_weight * input.age_secs + self.deadline_weight * slack / horizon
    }
}
