//! Pool sizing and timing knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_SOFT_IDLE_COUNT: usize = 1;
const DEFAULT_KILL_AFTER_MS: u64 = 60_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CANCEL_TIMEOUT_MS: u64 = 2_000;

fn default_max_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().clamp(2, 8))
        .unwrap_or(4)
}

fn default_soft_idle_count() -> usize {
    DEFAULT_SOFT_IDLE_COUNT
}

fn default_kill_after_ms() -> u64 {
    DEFAULT_KILL_AFTER_MS
}

fn default_cleanup_interval_ms() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

fn default_cancel_timeout_ms() -> u64 {
    DEFAULT_CANCEL_TIMEOUT_MS
}

/// Configuration for the worker pool.
///
/// Deserialized from the `[pool]` table of the config file; every field is
/// optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on live workers. Values below 1 are treated as 1.
    #[serde(default = "default_max_worker_count")]
    max_worker_count: usize,
    /// Idle workers the sweep always leaves alive.
    #[serde(default = "default_soft_idle_count")]
    soft_idle_count: usize,
    /// Workers unused for this long become reclamation candidates.
    #[serde(default = "default_kill_after_ms")]
    kill_after_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    cleanup_interval_ms: u64,
    /// Grace period between a cancel request and a forced kill.
    #[serde(default = "default_cancel_timeout_ms")]
    cancel_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_worker_count: default_max_worker_count(),
            soft_idle_count: DEFAULT_SOFT_IDLE_COUNT,
            kill_after_ms: DEFAULT_KILL_AFTER_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            cancel_timeout_ms: DEFAULT_CANCEL_TIMEOUT_MS,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_max_worker_count(mut self, count: usize) -> Self {
        self.max_worker_count = count;
        self
    }

    #[must_use]
    pub fn with_soft_idle_count(mut self, count: usize) -> Self {
        self.soft_idle_count = count;
        self
    }

    #[must_use]
    pub fn with_kill_after(mut self, after: Duration) -> Self {
        self.kill_after_ms = duration_ms(after);
        self
    }

    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn max_worker_count(&self) -> usize {
        self.max_worker_count.max(1)
    }

    #[must_use]
    pub fn soft_idle_count(&self) -> usize {
        self.soft_idle_count
    }

    #[must_use]
    pub fn kill_after(&self) -> Duration {
        Duration::from_millis(self.kill_after_ms)
    }

    /// Sweep period. Never zero, since it drives a timer.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    #[must_use]
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
