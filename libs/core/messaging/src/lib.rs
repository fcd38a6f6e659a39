//! Traced job queue on top of a broker-agnostic message broker.
//!
//! Three layers, each usable on its own:
//! - **Client** ([`BrokerClient`]): raw transport. Declare, publish, consume,
//!   settle. `amqp-worker` provides RabbitMQ, [`InMemoryBroker`] is for tests.
//! - **Broker** ([`MessageBroker`], [`TracedBroker`]): wraps a client with
//!   spans and carries the trace context in message metadata.
//! - **Processor** ([`JobProcessor`]): typed jobs, handler dispatch and
//!   ack/nack decisions.
//!
//! # Architecture
//!
//! ```text
//! publish_job ──▶ TracedBroker::publish ──▶ BrokerClient ──▶ queue
//!                  (producer span,                             │
//!                   traceparent → metadata)                    ▼
//! handler ◀── JobProcessor ◀── TracedBroker::consume ◀── deliveries
//!  (execute.handler) (process.job,   (metadata → Message::context)
//!                     ack / nack)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use messaging::{handler_fn, JobProcessor, Telemetry, TracedBroker};
//!
//! let telemetry = Telemetry::from_provider(&provider);
//! let broker = Arc::new(TracedBroker::new(amqp_client, telemetry));
//! let processor = JobProcessor::new(broker);
//!
//! processor.register_handler("email", handler_fn(|_cx, job| async move {
//!     tracing::info!(to = %job.payload["to"], "sending");
//!     Ok(())
//! }))?;
//! processor.start_consumer(&Context::new(), "email_queue").await?;
//! ```

pub mod broker;
pub mod carrier;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod shutdown;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broker::{Message, MessageBroker, MessageStream, TracedBroker};
pub use carrier::{MetadataExtractor, MetadataInjector};
pub use client::memory::InMemoryBroker;
pub use client::{
    Acker, BrokerClient, ConsumeOptions, Delivery, DeliveryStream, Envelope, Metadata,
    PublishOptions, QueueInfo,
};
pub use config::{BackoffStrategy, ConsumerConfig, RequeuePolicy};
pub use error::{BrokerError, ErrorCategory, JobProcessorError, ProcessingError};
pub use handler::{handler_fn, FailingHandler, FnHandler, JobHandler, NoOpHandler};
pub use job::{Job, JobStatus};
pub use processor::JobProcessor;
pub use registry::{HandlerEntry, HandlerRegistry};
pub use telemetry::Telemetry;
