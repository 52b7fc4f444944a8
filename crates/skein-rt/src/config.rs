// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! | Field | Default | Env |
//! |-------|---------|-----|
//! | `workers` | 0 (available parallelism) | `SKEIN_WORKERS` |
//! | `idle_timeout` | 1s | `SKEIN_IDLE_TIMEOUT_MS` |
//! | `thread_name_prefix` | `"skein-worker"` | |
//! | `prealloc_jobs` | 0 | `SKEIN_PREALLOC_JOBS` |

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 means one per available core.
    pub workers: usize,
    /// Upper bound a worker with nothing to run waits on the global queue
    /// before re-checking for shutdown.
    pub idle_timeout: Duration,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// Job records allocated into the free pool at startup.
    pub prealloc_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_timeout: Duration::from_secs(1),
            thread_name_prefix: "skein-worker".to_string(),
            prealloc_jobs: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SKEIN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, "SKEIN_WORKERS")? {
            config.workers = n as usize;
        }
        if let Some(ms) = parse_var(&lookup, "SKEIN_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "SKEIN_PREALLOC_JOBS")? {
            config.prealloc_jobs = n as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn prealloc_jobs(mut self, n: usize) -> Self {
        self.prealloc_jobs = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the machine's parallelism.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

fn parse_var<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::NotANumber { var, value: raw }),
    }
}
