//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default worker thread name.
pub const DEFAULT_WORKER_NAME: &str = "rstm-worker";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name given to the worker thread.
    pub worker_name: String,
    /// Maximum number of accepted triggers waiting for the worker (0 = unbounded).
    pub queue_capacity: usize,
    /// Interval at which an idle worker re-evaluates automatic transitions
    /// in milliseconds (0 = only after a step).
    pub auto_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            queue_capacity: 0,
            auto_poll_interval_ms: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_auto_poll_interval(mut self, interval: Duration) -> Self {
        self.auto_poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Applies `RSTM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("RSTM_WORKER_NAME") {
            if !name.is_empty() {
                self.worker_name = name;
            }
        }

        if let Ok(capacity) = std::env::var("RSTM_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(interval) = std::env::var("RSTM_AUTO_POLL_MS") {
            if let Ok(ms) = interval.parse() {
                self.auto_poll_interval_ms = ms;
            }
        }
    }

    /// Returns the poll interval, if polling is enabled.
    pub fn auto_poll_interval(&self) -> Option<Duration> {
        if self.auto_poll_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.auto_poll_interval_ms))
        }
    }

    /// Returns whether the trigger queue is bounded.
    pub fn is_bounded(&self) -> bool {
        self.queue_capacity > 0
    }
}
