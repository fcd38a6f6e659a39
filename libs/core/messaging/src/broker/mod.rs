//! Traced, broker-agnostic queue operations.

mod traced;

pub use traced::TracedBroker;

use crate::client::Delivery;
use crate::error::BrokerError;
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use opentelemetry::Context;
use std::fmt;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;

/// A consumed message together with the trace context its publisher sent.
pub struct Message {
    pub body: Vec<u8>,
    /// Settle handle. Pass it back to [`MessageBroker::ack`] or
    /// [`MessageBroker::nack`] exactly once.
    pub delivery: Delivery,
    /// Context extracted from the message metadata. Spans for processing this
    /// message should be children of it.
    pub context: Context,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

/// Messages forwarded from the broker, in delivery order.
pub type MessageStream = ReceiverStream<Message>;

/// Queue operations with trace propagation.
///
/// Every method takes the caller's context; the spans it opens are children
/// of that context.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Publish `payload` to `queue`, carrying the current trace context.
    async fn publish(&self, cx: &Context, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgement.
    ///
    /// The stream ends when the broker stops delivering or `shutdown` flips
    /// to `true`.
    async fn consume(
        &self,
        cx: &Context,
        queue: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<MessageStream, BrokerError>;

    async fn ack(&self, cx: &Context, delivery: Delivery) -> Result<(), BrokerError>;

    async fn nack(&self, cx: &Context, delivery: Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Tracer and propagator this broker reports through.
    fn telemetry(&self) -> &Telemetry;

    /// Transport name reported as `messaging.system`.
    fn system(&self) -> &'static str;
}
