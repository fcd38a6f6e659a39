//! Job dispatch on top of a [`MessageBroker`].
//!
//! Publishing wraps a payload into a [`Job`] and sends it as JSON. Consuming
//! runs one background task per queue; for each message it opens a
//! `process.job` span under the publisher's context, looks up the handler by
//! job type, runs it under an `execute.handler` span and acks or nacks the
//! delivery depending on the outcome.

use crate::broker::{Message, MessageBroker, MessageStream};
use crate::client::Delivery;
use crate::config::{ConsumerConfig, RequeuePolicy};
use crate::error::{JobProcessorError, ProcessingError};
use crate::handler::JobHandler;
use crate::job::Job;
use crate::metrics::JobMetrics;
use crate::registry::HandlerRegistry;
use crate::shutdown::{self, ShutdownReceiver, ShutdownSender};
use crate::telemetry::{attributes as attr, spans};
use futures::{FutureExt, StreamExt};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

struct Inner<B> {
    broker: Arc<B>,
    registry: HandlerRegistry,
    config: ConsumerConfig,
}

impl<B: MessageBroker> Inner<B> {
    async fn publish(&self, cx: &Context, queue: &str, job: &Job) -> Result<(), JobProcessorError> {
        let body = job.to_bytes()?;
        self.broker
            .publish(cx, queue, body)
            .await
            .map_err(JobProcessorError::Publish)?;
        JobMetrics::job_published(queue, &job.job_type);
        Ok(())
    }
}

struct ConsumerHandle {
    shutdown: ShutdownSender,
    task: JoinHandle<()>,
}

/// Publishes jobs and runs handlers for the jobs it consumes.
///
/// # Example
///
/// ```rust,ignore
/// let broker = Arc::new(TracedBroker::new(client, telemetry));
/// let processor = JobProcessor::new(broker);
///
/// processor.register_handler("email", EmailHandler::default())?;
/// processor.start_consumer(&Context::new(), "email_queue").await?;
///
/// let job = processor
///     .publish_job(&cx, "email_queue", "email", json!({"to": "a@b.com"}))
///     .await?;
/// ```
pub struct JobProcessor<B: MessageBroker> {
    inner: Arc<Inner<B>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl<B: MessageBroker> JobProcessor<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                registry: HandlerRegistry::new(),
                config: ConsumerConfig::default(),
            }),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the consumer configuration. Applies to consumers started
    /// afterwards.
    pub fn with_config(self, config: ConsumerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker: Arc::clone(&self.inner.broker),
                registry: self.inner.registry.clone(),
                config,
            }),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.inner.broker
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Register `handler` for `job_type`; failed jobs are dropped.
    pub fn register_handler(
        &self,
        job_type: impl Into<String>,
        handler: impl JobHandler,
    ) -> Result<(), JobProcessorError> {
        self.register_handler_with_policy(job_type, handler, RequeuePolicy::default())
    }

    pub fn register_handler_with_policy(
        &self,
        job_type: impl Into<String>,
        handler: impl JobHandler,
        policy: RequeuePolicy,
    ) -> Result<(), JobProcessorError> {
        let job_type = job_type.into();
        debug!(job_type = %job_type, policy = %policy, "Registering job handler");
        self.inner
            .registry
            .register(job_type, Arc::new(handler), policy)
    }

    /// Create a pending job and publish it to `queue`.
    ///
    /// Returns the job as published. Nothing is retried here; a broker
    /// failure is handed straight back.
    pub async fn publish_job(
        &self,
        cx: &Context,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
    ) -> Result<Job, JobProcessorError> {
        let job = Job::new(job_type, payload);
        self.inner.publish(cx, queue, &job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, queue, "Job published");
        Ok(job)
    }

    /// Start the background consumer for `queue`.
    ///
    /// Fails if the broker refuses to consume or a consumer for `queue` is
    /// already running.
    pub async fn start_consumer(&self, cx: &Context, queue: &str) -> Result<(), JobProcessorError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.get(queue) {
            if !existing.task.is_finished() {
                return Err(JobProcessorError::ConsumerAlreadyRunning(queue.to_string()));
            }
        }

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let messages = self
            .inner
            .broker
            .consume(cx, queue, shutdown_rx.clone())
            .await
            .map_err(JobProcessorError::Consume)?;

        let worker = Arc::new(QueueWorker {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            metrics: JobMetrics::new(queue),
            retries: std::sync::Mutex::new(JoinSet::new()),
        });
        let task = tokio::spawn(worker.run(messages, shutdown_rx));

        consumers.insert(
            queue.to_string(),
            ConsumerHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    pub async fn is_running(&self, queue: &str) -> bool {
        self.consumers
            .lock()
            .await
            .get(queue)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Signal the consumer for `queue` to stop and wait for it. The job in
    /// flight, if any, is finished first.
    pub async fn stop_consumer(&self, queue: &str) -> Result<(), JobProcessorError> {
        let handle = self
            .consumers
            .lock()
            .await
            .remove(queue)
            .ok_or_else(|| JobProcessorError::ConsumerNotRunning(queue.to_string()))?;
        stop(queue, handle).await;
        Ok(())
    }

    /// Stop every consumer.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.consumers.lock().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.shutdown.send(true);
        }
        for (queue, handle) in handles {
            stop(&queue, handle).await;
        }
        info!("Job processor shut down");
    }
}

impl<B: MessageBroker> Drop for JobProcessor<B> {
    fn drop(&mut self) {
        for handle in self.consumers.get_mut().values() {
            let _ = handle.shutdown.send(true);
        }
    }
}

async fn stop(queue: &str, handle: ConsumerHandle) {
    let _ = handle.shutdown.send(true);
    if let Err(e) = handle.task.await {
        error!(queue, error = %e, "Consumer task panicked");
    }
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, PartialEq)]
enum Disposition {
    Drop,
    Requeue,
    Republish(Duration),
}

fn disposition(policy: &RequeuePolicy, error: &ProcessingError, attempt: u32) -> Disposition {
    if !error.category().is_retryable() {
        return Disposition::Drop;
    }
    match policy {
        RequeuePolicy::Drop => Disposition::Drop,
        RequeuePolicy::RequeueImmediate => Disposition::Requeue,
        RequeuePolicy::RequeueWithBackoff {
            max_retries,
            backoff,
        } => {
            if attempt < *max_retries {
                let delay = error.retry_after().unwrap_or_else(|| backoff.delay(attempt));
                Disposition::Republish(delay)
            } else {
                Disposition::Drop
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Everything one queue's consumer task needs.
struct QueueWorker<B> {
    inner: Arc<Inner<B>>,
    queue: String,
    metrics: JobMetrics,
    /// Failed jobs waiting out their backoff before being republished.
    retries: std::sync::Mutex<JoinSet<()>>,
}

impl<B: MessageBroker> QueueWorker<B> {
    async fn run(self: Arc<Self>, messages: MessageStream, shutdown: ShutdownReceiver) {
        let workers = self.inner.config.workers;
        info!(queue = %self.queue, workers, "Job consumer started");

        if workers <= 1 {
            self.run_sequential(messages, shutdown).await;
        } else {
            self.run_pool(messages, shutdown, workers).await;
        }
        self.drain_retries().await;

        info!(queue = %self.queue, "Job consumer stopped");
    }

    /// One job at a time, in receipt order.
    async fn run_sequential(self: &Arc<Self>, mut messages: MessageStream, mut shutdown: ShutdownReceiver) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => break,
                message = messages.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.metrics.job_received();
            self.process(message, shutdown.clone()).await;
        }
    }

    /// Up to `workers` jobs at once. Completion order is not receipt order.
    async fn run_pool(
        self: &Arc<Self>,
        mut messages: MessageStream,
        mut shutdown: ShutdownReceiver,
        workers: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let message = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => break,
                message = messages.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!(queue = %self.queue, error = %e, "Job task panicked");
                }
            }

            self.metrics.job_received();
            self.metrics.in_flight(workers - semaphore.available_permits());
            let worker = Arc::clone(self);
            let job_shutdown = shutdown.clone();
            tasks.spawn(async move {
                worker.process(message, job_shutdown).await;
                drop(permit);
            });
        }

        // In-flight jobs run to completion.
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!(queue = %self.queue, error = %e, "Job task panicked");
            }
        }
        self.metrics.in_flight(0);
    }

    async fn process(self: &Arc<Self>, message: Message, shutdown: ShutdownReceiver) {
        let telemetry = self.inner.broker.telemetry();
        let Message {
            body,
            delivery,
            context,
        } = message;

        let job_cx = telemetry.start_span(
            spans::PROCESS_JOB,
            SpanKind::Consumer,
            &context,
            vec![
                KeyValue::new(attr::MESSAGING_SYSTEM, self.inner.broker.system()),
                KeyValue::new(attr::MESSAGING_DESTINATION, self.queue.clone()),
                KeyValue::new(attr::MESSAGING_DESTINATION_KIND, "queue"),
                KeyValue::new(attr::MESSAGING_OPERATION, "process"),
                KeyValue::new(attr::MESSAGING_MESSAGE_ID, delivery.message_id.clone().unwrap_or_default()),
                KeyValue::new(
                    attr::MESSAGING_CONVERSATION_ID,
                    delivery.correlation_id.clone().unwrap_or_default(),
                ),
                KeyValue::new(attr::MESSAGING_REDELIVERED, delivery.redelivered),
            ],
        );

        let mut job = match Job::from_bytes(&body) {
            Ok(job) => job,
            Err(e) => {
                let err = JobProcessorError::Deserialization(e);
                warn!(queue = %self.queue, error = %err, "Rejecting malformed message");
                fail_span(&job_cx, &err);
                self.nack(&job_cx, delivery, false, "malformed").await;
                job_cx.span().end();
                return;
            }
        };

        job_cx.span().set_attribute(KeyValue::new(attr::JOB_ID, job.id.clone()));
        job_cx.span().set_attribute(KeyValue::new(attr::JOB_TYPE, job.job_type.clone()));
        job_cx.span().set_attribute(KeyValue::new(attr::JOB_ATTEMPT, i64::from(job.attempt)));

        let Some(entry) = self.inner.registry.get(&job.job_type) else {
            let err = JobProcessorError::NoHandler(job.job_type.clone());
            job_cx.span().set_attribute(KeyValue::new(attr::JOB_STATUS, job.status.as_str()));
            warn!(job_id = %job.id, job_type = %job.job_type, "No handler registered, rejecting job");
            fail_span(&job_cx, &err);
            self.nack(&job_cx, delivery, false, "no_handler").await;
            job_cx.span().end();
            return;
        };

        let handler_cx = telemetry.start_span(
            spans::EXECUTE_HANDLER,
            SpanKind::Internal,
            &job_cx,
            vec![
                KeyValue::new(attr::JOB_ID, job.id.clone()),
                KeyValue::new(attr::JOB_TYPE, job.job_type.clone()),
                KeyValue::new(attr::JOB_REQUEUE_POLICY, entry.policy.as_str()),
            ],
        );

        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt, "Processing job");
        let started = Instant::now();
        let result = self.run_handler(entry.handler.as_ref(), &handler_cx, &job).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                job.mark_complete();
                handler_cx.span().set_status(Status::Ok);
                job_cx.span().set_attribute(KeyValue::new(attr::JOB_STATUS, job.status.as_str()));
                job_cx.span().set_status(Status::Ok);
                self.metrics.job_completed(&job.job_type, elapsed);
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                self.ack(&handler_cx, delivery).await;
            }
            Err(e) => {
                job.mark_failed(&e);
                fail_span(&handler_cx, &e);
                job_cx.span().set_attribute(KeyValue::new(attr::JOB_STATUS, job.status.as_str()));
                job_cx
                    .span()
                    .set_attribute(KeyValue::new(attr::JOB_ERROR, e.to_string()));
                job_cx.span().set_status(Status::error(e.to_string()));
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    category = %e.category(),
                    error = %e,
                    "Job failed"
                );
                self.handle_failure(&handler_cx, delivery, &job, &entry.policy, &e, shutdown)
                    .await;
            }
        }

        handler_cx.span().end();
        job_cx.span().end();
    }

    async fn run_handler(
        &self,
        handler: &dyn JobHandler,
        cx: &Context,
        job: &Job,
    ) -> Result<(), ProcessingError> {
        let run = AssertUnwindSafe(handler.handle(cx, job)).catch_unwind();
        let outcome = match self.inner.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(ProcessingError::Timeout(limit)),
            },
            None => run.await,
        };
        outcome.unwrap_or_else(|panic| {
            Err(ProcessingError::permanent(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
    }

    async fn handle_failure(
        self: &Arc<Self>,
        cx: &Context,
        delivery: Delivery,
        job: &Job,
        policy: &RequeuePolicy,
        error: &ProcessingError,
        shutdown: ShutdownReceiver,
    ) {
        let reason = error.category().as_str();
        match disposition(policy, error, job.attempt) {
            Disposition::Drop => self.nack(cx, delivery, false, reason).await,
            Disposition::Requeue => self.nack(cx, delivery, true, reason).await,
            Disposition::Republish(delay) => {
                debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Retrying job after backoff");
                let worker = Arc::clone(self);
                let cx = cx.clone();
                let retry = job.next_attempt();
                self.spawn_retry(async move {
                    worker
                        .republish_after(delay, cx, delivery, retry, reason, shutdown)
                        .await;
                });
            }
        }
    }

    /// Run a delayed republish next to the consumer loop so the rest of the
    /// queue keeps flowing during the backoff.
    fn spawn_retry(&self, retry: impl Future<Output = ()> + Send + 'static) {
        let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = retries.try_join_next() {
            if let Err(e) = finished {
                error!(queue = %self.queue, error = %e, "Retry task panicked");
            }
        }
        retries.spawn(retry);
    }

    /// Wait for pending retries. After shutdown they nack with requeue at
    /// once; otherwise they finish their backoff first.
    async fn drain_retries(&self) {
        let mut retries = {
            let mut guard = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        if !retries.is_empty() {
            debug!(queue = %self.queue, pending = retries.len(), "Waiting for pending retries");
        }
        while let Some(finished) = retries.join_next().await {
            if let Err(e) = finished {
                error!(queue = %self.queue, error = %e, "Retry task panicked");
            }
        }
    }

    /// Wait `delay`, republish `retry` and ack the failed delivery. Shutdown
    /// during the wait hands the delivery back to the broker instead.
    async fn republish_after(
        &self,
        delay: Duration,
        cx: Context,
        delivery: Delivery,
        retry: Job,
        reason: &'static str,
        mut shutdown: ShutdownReceiver,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown::cancelled(&mut shutdown) => {
                self.nack(&cx, delivery, true, reason).await;
                return;
            }
        }

        match self.inner.publish(&cx, &self.queue, &retry).await {
            Ok(()) => {
                self.metrics.job_retried(&retry.job_type);
                info!(job_id = %retry.id, attempt = retry.attempt, "Job republished for retry");
                self.ack(&cx, delivery).await;
            }
            Err(e) => {
                error!(job_id = %retry.id, error = %e, "Failed to republish job, requeueing");
                cx.span().record_error(&e);
                self.nack(&cx, delivery, true, reason).await;
            }
        }
    }

    async fn ack(&self, cx: &Context, delivery: Delivery) {
        if let Err(e) = self.inner.broker.ack(cx, delivery).await {
            error!(queue = %self.queue, error = %e, "Failed to ack message");
            self.metrics.settle_failed("ack");
        }
    }

    async fn nack(&self, cx: &Context, delivery: Delivery, requeue: bool, reason: &str) {
        self.metrics.job_nacked(reason, requeue);
        if let Err(e) = self.inner.broker.nack(cx, delivery, requeue).await {
            error!(queue = %self.queue, error = %e, "Failed to nack message");
            self.metrics.settle_failed("nack");
        }
    }
}

fn fail_span(cx: &Context, err: &(dyn std::error::Error + 'static)) {
    let span = cx.span();
    span.record_error(err);
    span.set_status(Status::error(err.to_string()));
}
