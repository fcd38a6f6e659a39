//! RabbitMQ backend for the `messaging` job queue.
//!
//! [`AmqpClient`] implements [`messaging::BrokerClient`] on top of `lapin`:
//! durable queues on the default exchange, publisher confirms, manual
//! acknowledgement, and message metadata carried as AMQP headers so trace
//! context survives the hop.
//!
//! # Example
//!
//! ```rust,ignore
//! use amqp_worker::{AmqpClient, AmqpConfig};
//! use core_config::FromEnv;
//! use messaging::{JobProcessor, Telemetry, TracedBroker};
//!
//! let client = AmqpClient::connect(&AmqpConfig::from_env()?).await?;
//! let broker = Arc::new(TracedBroker::new(client, Telemetry::from_provider(&provider)));
//! let processor = JobProcessor::new(broker);
//! ```

mod client;
mod config;
pub mod headers;

pub use client::AmqpClient;
pub use config::AmqpConfig;
