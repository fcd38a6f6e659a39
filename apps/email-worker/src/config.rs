//! Configuration for the email worker

use amqp_worker::AmqpConfig;
use core_config::telemetry::TelemetryConfig;
use core_config::{env_parse, ConfigError, FromEnv};
use messaging::{BackoffStrategy, ConsumerConfig, RequeuePolicy};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub amqp: AmqpConfig,
    pub consumer: ConsumerConfig,
    pub telemetry: TelemetryConfig,
    /// Port of the Prometheus scrape endpoint
    pub metrics_port: u16,
    /// Simulated send time per email
    pub send_delay: Duration,
    /// Retries for transient failures; 0 drops on the first failure
    pub max_retries: u32,
}

impl WorkerConfig {
    /// Requeue policy for the email handler.
    pub fn requeue_policy(&self) -> RequeuePolicy {
        if self.max_retries == 0 {
            RequeuePolicy::Drop
        } else {
            RequeuePolicy::with_backoff(self.max_retries, BackoffStrategy::default())
        }
    }
}

impl FromEnv for WorkerConfig {
    /// Broker, consumer and telemetry settings come from their own sections
    /// (`RABBITMQ_*`, `JOB_*`, `OTEL_*`). Worker specific:
    /// - METRICS_PORT: defaults to 9090
    /// - EMAIL_SEND_DELAY_MS: defaults to 1000
    /// - EMAIL_MAX_RETRIES: defaults to 3
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            amqp: AmqpConfig::from_env()?,
            consumer: ConsumerConfig::from_env()?,
            telemetry: TelemetryConfig::from_env()?,
            metrics_port: env_parse("METRICS_PORT", "9090")?,
            send_delay: Duration::from_millis(env_parse("EMAIL_SEND_DELAY_MS", "1000")?),
            max_retries: env_parse("EMAIL_MAX_RETRIES", "3")?,
        })
    }
}
