//! Process and thread pool configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_range, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for the number of inner threads per worker process
pub const MAX_THREAD_WIDTH: usize = 32;

/// Pool configuration
///
/// `max_tasks_per_child` and `child_concurrency` are expressed per inner
/// thread. Each process multiplies them by its thread width, see
/// [`PoolConfig::effective_ttl`] and [`PoolConfig::effective_concurrency`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes, defaults to the host core count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<usize>,

    /// Inner threads per process, defaults to core count + 4 capped at 32
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Number of channel pairs shared by the processes
    #[serde(default = "default_queue_count")]
    pub queue_count: usize,

    /// Tasks an inner thread may accept before retiring, 0 means unlimited
    #[serde(default)]
    pub max_tasks_per_child: u64,

    /// Tasks an inner thread may run at the same time
    #[serde(default = "default_child_concurrency")]
    pub child_concurrency: usize,

    /// Cooperative backoff when a control loop finds no work
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// How long shutdown waits for workers to drain before killing them
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Capacity of every inbound and outbound channel on the manager side
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Replace worker processes that die unexpectedly
    #[serde(default = "crate::domains::utils::default_true")]
    pub restart_on_crash: bool,

    /// Crash replacements allowed per worker slot
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: None,
            threads: None,
            queue_count: default_queue_count(),
            max_tasks_per_child: 0,
            child_concurrency: default_child_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            channel_capacity: default_channel_capacity(),
            restart_on_crash: true,
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

impl PoolConfig {
    /// Number of worker processes to spawn
    pub fn process_count(&self) -> usize {
        self.processes.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Number of inner threads per worker process
    pub fn thread_width(&self) -> usize {
        self.threads
            .unwrap_or_else(|| num_cpus::get() + 4)
            .min(MAX_THREAD_WIDTH)
    }

    /// Tasks a whole process accepts before retiring, 0 means unlimited
    pub fn effective_ttl(&self) -> u64 {
        self.max_tasks_per_child * self.thread_width() as u64
    }

    /// Tasks a whole process keeps in flight at most
    pub fn effective_concurrency(&self) -> usize {
        (self.child_concurrency * self.thread_width()).max(1)
    }

    /// Queue a worker process is bound to
    pub fn queue_for_worker(&self, worker_index: usize) -> usize {
        worker_index % self.queue_count.max(1)
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(processes) = self.processes {
            validate_positive(processes, "processes", self.domain_name())?;
        }

        if let Some(threads) = self.threads {
            validate_range(threads, 1, MAX_THREAD_WIDTH, "threads", self.domain_name())?;
        }

        validate_positive(self.queue_count, "queue_count", self.domain_name())?;
        if self.queue_count > self.process_count() {
            return Err(self.validation_error(format!(
                "queue_count must be <= process count ({} > {})",
                self.queue_count,
                self.process_count()
            )));
        }

        validate_positive(
            self.poll_interval.as_millis(),
            "poll_interval",
            self.domain_name(),
        )?;
        validate_positive(self.channel_capacity, "channel_capacity", self.domain_name())?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

// Default value functions
fn default_queue_count() -> usize {
    1
}

fn default_child_concurrency() -> usize {
    16
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_restart_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.queue_count, 1);
        assert_eq!(config.max_tasks_per_child, 0);
        assert_eq!(config.child_concurrency, 16);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(config.process_count() >= 1);
        assert!(config.thread_width() >= 1 && config.thread_width() <= MAX_THREAD_WIDTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_count_above_process_count_is_rejected() {
        let config = PoolConfig {
            processes: Some(2),
            queue_count: 3,
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_count must be <= process count"));
    }

    #[test]
    fn test_thread_width_bounds() {
        let mut config = PoolConfig {
            threads: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.threads = Some(33);
        assert!(config.validate().is_err());

        config.threads = Some(32);
        assert!(config.validate().is_ok());
        assert_eq!(config.thread_width(), 32);
    }

    #[test]
    fn test_budgets_scale_with_thread_width() {
        let config = PoolConfig {
            threads: Some(4),
            max_tasks_per_child: 3,
            child_concurrency: 2,
            ..Default::default()
        };
        assert_eq!(config.effective_ttl(), 12);
        assert_eq!(config.effective_concurrency(), 8);

        let unbounded = PoolConfig {
            threads: Some(4),
            child_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(unbounded.effective_ttl(), 0);
        assert_eq!(unbounded.effective_concurrency(), 1);
    }

    #[test]
    fn test_workers_are_spread_over_queues() {
        let config = PoolConfig {
            processes: Some(5),
            queue_count: 2,
            ..Default::default()
        };
        assert_eq!(config.queue_for_worker(0), 0);
        assert_eq!(config.queue_for_worker(3), 1);
        assert_eq!(config.queue_for_worker(4), 0);
    }
}
