//! Runtime configuration.
//!
//! Every struct deserializes with defaults for missing fields; durations are
//! written as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::domain::{Priority, WorkerId};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of one worker claim loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generated per process start when absent.
    pub worker_id: Option<WorkerId>,
    /// Maximum tasks per claim call.
    pub batch_size: usize,
    /// Maximum in-flight tasks in this worker.
    pub concurrency: usize,
    #[serde(with = "duration_ms")]
    pub poll_interval_min: Duration,
    #[serde(with = "duration_ms")]
    pub poll_interval_max: Duration,
    /// Upper bound for one attempt, including any breaker-guarded call.
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// How long in-flight tasks may run after shutdown was requested.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Delay applied when a breaker refuses a task.
    #[serde(with = "duration_ms")]
    pub breaker_release_delay: Duration,
    /// Attempts for store operations failing with `Unavailable`.
    pub op_retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub op_retry_base: Duration,
    /// Minimum time between persisted progress reports of one task.
    #[serde(with = "duration_ms")]
    pub progress_min_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            batch_size: 1,
            concurrency: 1,
            poll_interval_min: Duration::from_millis(100),
            poll_interval_max: Duration::from_secs(5),
            task_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(330),
            heartbeat_interval: Duration::from_secs(10),
            breaker_release_delay: Duration::from_secs(5),
            op_retry_attempts: 5,
            op_retry_base: Duration::from_millis(100),
            progress_min_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_interval_min = min;
        self.poll_interval_max = max;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_breaker_release_delay(mut self, delay: Duration) -> Self {
        self.breaker_release_delay = delay;
        self
    }
}

/// Age-based priority promotion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Pending tasks eligible for longer than this get promoted.
    #[serde(with = "duration_ms")]
    pub age_threshold: Duration,
    pub step: u8,
    pub cap: Priority,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            age_threshold: Duration::from_secs(600),
            step: 1,
            cap: Priority::new(8).unwrap_or(Priority::MAX),
        }
    }
}

/// Settings of the liveness sweep (reaper loop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Processing longer than this means the claimant is presumed dead.
    #[serde(with = "duration_ms")]
    pub stuck_threshold: Duration,
    /// Heartbeat interval the workers were configured with.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    /// `None` disables promotion.
    pub promotion: Option<PromotionConfig>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(10),
            max_missed_heartbeats: 3,
            promotion: Some(PromotionConfig::default()),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
}

impl WeftConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: WeftConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let w = &self.worker;
        if w.batch_size == 0 {
            return invalid("worker.batch_size must be at least 1");
        }
        if w.concurrency == 0 {
            return invalid("worker.concurrency must be at least 1");
        }
        if w.poll_interval_min.is_zero() || w.poll_interval_min > w.poll_interval_max {
            return invalid("worker.poll_interval_min must be > 0 and <= poll_interval_max");
        }
        if w.shutdown_grace <= w.task_timeout {
            return invalid("worker.shutdown_grace must exceed worker.task_timeout");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.call_timeout >= w.task_timeout {
            return invalid("breaker.call_timeout must be shorter than worker.task_timeout");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid("retry.base_delay must not exceed retry.max_delay");
        }
        if self.reaper.stuck_threshold <= w.shutdown_grace {
            return invalid("reaper.stuck_threshold must exceed worker.shutdown_grace");
        }
        if self.reaper.max_missed_heartbeats == 0 {
            return invalid("reaper.max_missed_heartbeats must be at least 1");
        }
        if w.heartbeat_interval.is_zero() || w.heartbeat_interval > self.reaper.heartbeat_interval {
            return invalid("worker.heartbeat_interval must be > 0 and <= reaper.heartbeat_interval");
        }
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
