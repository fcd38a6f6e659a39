//! Consumer and requeue configuration.

use core_config::{env_parse, ConfigError, FromEnv};
use std::fmt;
use std::time::Duration;

/// How a [`JobProcessor`](crate::JobProcessor) consumes one queue.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Jobs processed at once. `1` keeps strict receipt order; anything
    /// larger trades ordering for throughput.
    pub workers: usize,

    /// Upper bound on a single handler run. Exceeding it counts as a
    /// transient failure.
    pub handler_timeout: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            handler_timeout: None,
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

impl FromEnv for ConsumerConfig {
    /// Reads `JOB_WORKERS` (default 1) and `JOB_HANDLER_TIMEOUT_MS`
    /// (default unset, `0` also means unset).
    fn from_env() -> Result<Self, ConfigError> {
        let workers = env_parse::<usize>("JOB_WORKERS", "1")?;
        let timeout_ms = env_parse::<u64>("JOB_HANDLER_TIMEOUT_MS", "0")?;

        let mut config = Self::default().with_workers(workers);
        if timeout_ms > 0 {
            config = config.with_handler_timeout(Duration::from_millis(timeout_ms));
        }
        Ok(config)
    }
}

/// What to do with a job whose handler failed with a retryable error.
///
/// Permanent errors ([`ErrorCategory::Permanent`](crate::ErrorCategory))
/// are always dropped, whatever the policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequeuePolicy {
    /// Reject without requeue.
    #[default]
    Drop,

    /// Reject with requeue; the broker redelivers right away.
    RequeueImmediate,

    /// Wait, republish with `attempt + 1`, then ack the original. Once
    /// `max_retries` republishes have happened the job is dropped.
    RequeueWithBackoff {
        max_retries: u32,
        backoff: BackoffStrategy,
    },
}

impl RequeuePolicy {
    pub fn with_backoff(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self::RequeueWithBackoff {
            max_retries,
            backoff,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequeuePolicy::Drop => "drop",
            RequeuePolicy::RequeueImmediate => "requeue_immediate",
            RequeuePolicy::RequeueWithBackoff { .. } => "requeue_with_backoff",
        }
    }
}

impl fmt::Display for RequeuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before republishing a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Fixed(Duration),

    /// `base * 2^attempt`, capped at `max`
    Exponential { base: Duration, max: Duration },

    /// `base * (attempt + 1)`, capped at `max`
    Linear { base: Duration, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => base
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(*max),
            BackoffStrategy::Linear { base, max } => {
                base.saturating_mul(attempt.saturating_add(1)).min(*max)
            }
        }
    }
}
