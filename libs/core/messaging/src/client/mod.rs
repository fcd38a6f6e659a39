//! Transport-level broker contract.
//!
//! A [`BrokerClient`] owns the connection and channel to a concrete broker and
//! knows nothing about tracing or jobs. Everything it returns is raw: bytes,
//! metadata and a settle handle per delivery.

pub mod memory;

use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// String-keyed message metadata (AMQP headers, NATS headers, ...).
pub type Metadata = HashMap<String, String>;

/// What gets published: payload plus metadata and optional identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub metadata: Metadata,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Empty string means the default exchange, which routes by queue name.
    pub exchange: String,
    pub routing_key: String,
    /// Fail the publish if the message cannot be routed to any queue.
    pub mandatory: bool,
    /// Fail the publish if no consumer can take the message right now.
    pub immediate: bool,
}

impl PublishOptions {
    /// Default exchange, routed straight to `queue`, no delivery flags.
    pub fn to_queue(queue: impl Into<String>) -> Self {
        Self {
            routing_key: queue.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Empty string lets the broker generate one.
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles one delivery on the broker side.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    /// Called when a delivery is dropped without being settled.
    fn abandon(&self) {}
}

/// A message received from the broker, waiting to be settled.
///
/// `ack` and `nack` consume the delivery, so one handle can only be settled
/// once. Dropping an unsettled delivery hands it back to the client.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub metadata: Metadata,
    pub body: Vec<u8>,
    acker: Arc<dyn Acker>,
    settled: bool,
}

impl Delivery {
    pub fn new(delivery_tag: u64, envelope: Envelope, acker: Arc<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            consumer_tag: String::new(),
            redelivered: false,
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            metadata: envelope.metadata,
            body: envelope.body,
            acker,
            settled: false,
        }
    }

    pub fn with_routing(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.settled = true;
        self.acker.ack().await
    }

    pub async fn nack(mut self, requeue: bool) -> Result<(), BrokerError> {
        self.settled = true;
        self.acker.nack(requeue).await
    }

    /// Mark the delivery as settled without telling the broker.
    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
    }

    /// Take the payload and identifiers back out, leaving the delivery empty.
    pub(crate) fn take_envelope(&mut self) -> Envelope {
        Envelope {
            body: std::mem::take(&mut self.body),
            metadata: std::mem::take(&mut self.metadata),
            message_id: self.message_id.take(),
            correlation_id: self.correlation_id.take(),
        }
    }

    #[cfg(test)]
    pub(crate) fn acker(&self) -> Arc<dyn Acker> {
        Arc::clone(&self.acker)
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                delivery_tag = self.delivery_tag,
                routing_key = %self.routing_key,
                "Delivery dropped without ack or nack"
            );
            self.acker.abandon();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("consumer_tag", &self.consumer_tag)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Raw broker operations. Implementations never retry.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Declare a durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, BrokerError>;

    async fn publish(&self, options: PublishOptions, envelope: Envelope) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// `messaging.system` attribute value, also used as span name prefix.
    fn system(&self) -> &'static str;

    fn protocol(&self) -> &'static str {
        "AMQP"
    }

    fn protocol_version(&self) -> &'static str {
        "0.9.1"
    }
}

#[async_trait]
impl<C: BrokerClient + ?Sized> BrokerClient for Arc<C> {
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        (**self).declare_queue(name).await
    }

    async fn publish(&self, options: PublishOptions, envelope: Envelope) -> Result<(), BrokerError> {
        (**self).publish(options, envelope).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream, BrokerError> {
        (**self).consume(queue, options).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }

    fn system(&self) -> &'static str {
        (**self).system()
    }

    fn protocol(&self) -> &'static str {
        (**self).protocol()
    }

    fn protocol_version(&self) -> &'static str {
        (**self).protocol_version()
    }
}
