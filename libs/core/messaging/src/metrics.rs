//! Job processor metrics.
//!
//! Emitted through the `metrics` facade; nothing is recorded until the
//! application installs a recorder (see `email-worker`).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

#[derive(Clone)]
pub struct JobMetrics {
    queue: String,
}

impl JobMetrics {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }

    pub fn job_published(queue: &str, job_type: &str) {
        counter!(
            "job_processor_jobs_published_total",
            "queue" => queue.to_string(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn job_received(&self) {
        counter!(
            "job_processor_jobs_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a job whose handler succeeded.
    pub fn job_completed(&self, job_type: &str, duration: Duration) {
        counter!(
            "job_processor_jobs_acked_total",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            "job_processor_job_duration_seconds",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a nack. `reason` is one of `malformed`, `no_handler`, or the
    /// handler error category.
    pub fn job_nacked(&self, reason: &str, requeue: bool) {
        counter!(
            "job_processor_jobs_nacked_total",
            "queue" => self.queue.clone(),
            "reason" => reason.to_string(),
            "requeue" => requeue.to_string()
        )
        .increment(1);
    }

    pub fn job_retried(&self, job_type: &str) {
        counter!(
            "job_processor_jobs_retried_total",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    pub fn settle_failed(&self, operation: &'static str) {
        counter!(
            "job_processor_settle_failures_total",
            "queue" => self.queue.clone(),
            "operation" => operation
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "job_processor_jobs_in_flight",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }
}
