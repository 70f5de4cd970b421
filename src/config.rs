use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Runtime configuration.
///
/// Loaded from `~/.tasknet/tasknet.toml`, or built from a flat map of
/// dotted keys such as `retry.max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots.
    pub pool_size: usize,
    /// How long a cancelled execution may keep running before it is
    /// abandoned.
    pub cancel_grace_ms: u64,
    /// Per-attempt execution limit. Unset means no limit.
    pub task_timeout_ms: Option<u64>,
    /// How often queued tasks are re-aged.
    pub aging_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            cancel_grace_ms: 1_000,
            task_timeout_ms: None,
            aging_interval_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.backoff_base_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.backoff_max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Weights for the default priority function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Key reduction per second spent waiting.
    pub age_weight: f64,
    /// Key contribution of a full horizon of deadline slack.
    pub deadline_weight: f64,
    /// Slack beyond this many seconds counts as no deadline.
    pub deadline_horizon_secs: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            age_weight: 0.1,
            deadline_weight: 1.0,
            deadline_horizon_secs: 3_600.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Peers not heard from within this window are not delegated to.
    pub staleness_threshold_ms: u64,
    pub offer_timeout_ms: u64,
    pub result_timeout_ms: u64,
    pub gossip_interval_ms: u64,
    /// Largest Hamming distance at which a peer may take a task.
    pub max_delegation_distance: u32,
    /// Delegated tasks hosted here at once.
    pub accept_capacity: usize,
    /// Bounded size of peer inboxes and the command channel.
    pub send_buffer: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 5_000,
            offer_timeout_ms: 2_000,
            result_timeout_ms: 60_000,
            gossip_interval_ms: 1_000,
            max_delegation_distance: 256,
            accept_capacity: 4,
            send_buffer: 64,
        }
    }
}

impl CoordinationConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}

impl Config {
    pub fn tasknet_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tasknet"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tasknet_dir()?.join("tasknet.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            pool_size = config.workers.pool_size,
            max_retries = config.retry.max_retries,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Defaults overridden by a flat key/value map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(map)?;
        Ok(config)
    }

    /// Apply dotted `section.field` overrides, then validate.
    pub fn apply_overrides(&mut self, map: &HashMap<String, String>) -> Result<()> {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        for key in keys {
            self.set(key, &map[key])?;
        }
        self.validate()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "workers.pool_size" => self.workers.pool_size = parse(key, value)?,
            "workers.cancel_grace_ms" => self.workers.cancel_grace_ms = parse(key, value)?,
            "workers.task_timeout_ms" => {
                self.workers.task_timeout_ms = match value.trim() {
                    "" | "none" => None,
                    v => Some(parse(key, v)?),
                }
            }
            "workers.aging_interval_ms" => self.workers.aging_interval_ms = parse(key, value)?,
            "retry.max_retries" => self.retry.max_retries = parse(key, value)?,
            "retry.backoff_base_ms" => self.retry.backoff_base_ms = parse(key, value)?,
            "retry.backoff_max_ms" => self.retry.backoff_max_ms = parse(key, value)?,
            "retry.backoff_multiplier" => self.retry.backoff_multiplier = parse(key, value)?,
            "priority.age_weight" => self.priority.age_weight = parse(key, value)?,
            "priority.deadline_weight" => self.priority.deadline_weight = parse(key, value)?,
            "priority.deadline_horizon_secs" => {
                self.priority.deadline_horizon_secs = parse(key, value)?
            }
            "coordination.staleness_threshold_ms" => {
                self.coordination.staleness_threshold_ms = parse(key, value)?
            }
            "coordination.offer_timeout_ms" => {
                self.coordination.offer_timeout_ms = parse(key, value)?
            }
            "coordination.result_timeout_ms" => {
                self.coordination.result_timeout_ms = parse(key, value)?
            }
            "coordination.gossip_interval_ms" => {
                self.coordination.gossip_interval_ms = parse(key, value)?
            }
            "coordination.max_delegation_distance" => {
                self.coordination.max_delegation_distance = parse(key, value)?
            }
            "coordination.accept_capacity" => {
                self.coordination.accept_capacity = parse(key, value)?
            }
            "coordination.send_buffer" => self.coordination.send_buffer = parse(key, value)?,
            other => return Err(Error::Config(format!("unknown key: {}", other))),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.pool_size == 0 {
            return Err(Error::Config("workers.pool_size must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(Error::Config(
                "retry.backoff_base_ms exceeds retry.backoff_max_ms".into(),
            ));
        }
        if self.priority.deadline_horizon_secs <= 0.0 {
            return Err(Error::Config(
                "priority.deadline_horizon_secs must be positive".into(),
            ));
        }
        if self.coordination.gossip_interval_ms == 0 || self.workers.aging_interval_ms == 0 {
            return Err(Error::Config("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
}
