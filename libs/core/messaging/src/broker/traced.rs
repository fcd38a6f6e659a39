use super::{Message, MessageBroker, MessageStream};
use crate::client::{BrokerClient, ConsumeOptions, Delivery, DeliveryStream, Envelope, PublishOptions, QueueInfo};
use crate::error::BrokerError;
use crate::shutdown::{self, ShutdownReceiver};
use crate::telemetry::{attributes as attr, Telemetry};
use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};
use uuid::Uuid;

const DEFAULT_BUFFER: usize = 64;

/// [`MessageBroker`] over any [`BrokerClient`], with a span around every
/// queue operation.
///
/// Span names are prefixed with the client's system, e.g.
/// `rabbitmq.publish`, `rabbitmq.consume.setup`, `rabbitmq.ack`.
pub struct TracedBroker<C> {
    client: C,
    telemetry: Telemetry,
    buffer: usize,
    consumer_tag: String,
}

impl<C: BrokerClient> TracedBroker<C> {
    pub fn new(client: C, telemetry: Telemetry) -> Self {
        Self {
            client,
            telemetry,
            buffer: DEFAULT_BUFFER,
            consumer_tag: String::new(),
        }
    }

    /// Capacity of the channel between the forwarding task and the consumer.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Consumer tag sent with every consume; empty lets the broker pick.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn span_name(&self, operation: &str) -> String {
        format!("{}.{}", self.client.system(), operation)
    }

    fn destination_attributes(&self, queue: &str, operation: &'static str) -> Vec<KeyValue> {
        vec![
            KeyValue::new(attr::MESSAGING_SYSTEM, self.client.system()),
            KeyValue::new(attr::MESSAGING_DESTINATION, queue.to_string()),
            KeyValue::new(attr::MESSAGING_DESTINATION_KIND, "queue"),
            KeyValue::new(attr::MESSAGING_OPERATION, operation),
        ]
    }

    fn protocol_attributes(&self) -> [KeyValue; 2] {
        [
            KeyValue::new(attr::MESSAGING_PROTOCOL, self.client.protocol()),
            KeyValue::new(attr::MESSAGING_PROTOCOL_VERSION, self.client.protocol_version()),
        ]
    }

    fn settle_attributes(&self, operation: &'static str, delivery: &Delivery) -> Vec<KeyValue> {
        vec![
            KeyValue::new(attr::MESSAGING_SYSTEM, self.client.system()),
            KeyValue::new(attr::MESSAGING_OPERATION, operation),
            KeyValue::new(
                attr::MESSAGING_MESSAGE_ID,
                delivery.message_id.clone().unwrap_or_default(),
            ),
            KeyValue::new(
                attr::MESSAGING_CONVERSATION_ID,
                delivery.correlation_id.clone().unwrap_or_default(),
            ),
            KeyValue::new(attr::MESSAGING_ROUTING_KEY, delivery.routing_key.clone()),
            KeyValue::new(attr::MESSAGING_CONSUMER_TAG, delivery.consumer_tag.clone()),
            KeyValue::new(attr::MESSAGING_DELIVERY_TAG, delivery.delivery_tag as i64),
        ]
    }

    async fn declare_queue(&self, cx: &Context, queue: &str) -> Result<QueueInfo, BrokerError> {
        let mut attributes = self.destination_attributes(queue, "declare");
        attributes.push(KeyValue::new(attr::MESSAGING_QUEUE, queue.to_string()));
        let span_cx = self.telemetry.start_span(
            self.span_name("queue.declare"),
            SpanKind::Internal,
            cx,
            attributes,
        );

        let result = self.client.declare_queue(queue).await;
        if let Err(e) = &result {
            record_failure(&span_cx, e);
        }
        span_cx.span().end();
        result
    }
}

fn record_failure(cx: &Context, err: &BrokerError) {
    let span = cx.span();
    span.record_error(err);
    span.set_status(Status::error(err.to_string()));
}

#[async_trait]
impl<C: BrokerClient> MessageBroker for TracedBroker<C> {
    async fn publish(&self, cx: &Context, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let message_id = Uuid::new_v4().to_string();
        let mut attributes = self.destination_attributes(queue, "publish");
        attributes.extend(self.protocol_attributes());
        attributes.extend([
            KeyValue::new(attr::MESSAGING_MESSAGE_SIZE, payload.len() as i64),
            KeyValue::new(attr::MESSAGING_MESSAGE_ID, message_id.clone()),
            KeyValue::new(attr::MESSAGING_ROUTING_KEY, queue.to_string()),
            KeyValue::new(attr::MESSAGING_EXCHANGE, ""),
        ]);
        let span_cx = self
            .telemetry
            .start_span(self.span_name("publish"), SpanKind::Producer, cx, attributes);

        // Inject the publish span itself so the consumer side hangs off it.
        let metadata = self.telemetry.inject(&span_cx);
        let envelope = Envelope::new(payload)
            .with_metadata(metadata)
            .with_message_id(message_id);

        let result = self
            .client
            .publish(PublishOptions::to_queue(queue), envelope)
            .await;
        if let Err(e) = &result {
            record_failure(&span_cx, e);
            error!(queue, error = %e, "Failed to publish message");
        }
        span_cx.span().end();
        result
    }

    async fn consume(
        &self,
        cx: &Context,
        queue: &str,
        shutdown: ShutdownReceiver,
    ) -> Result<MessageStream, BrokerError> {
        let mut attributes = self.destination_attributes(queue, "consume");
        attributes.extend(self.protocol_attributes());
        attributes.push(KeyValue::new(attr::MESSAGING_QUEUE, queue.to_string()));
        let setup_cx = self.telemetry.start_span(
            self.span_name("consume.setup"),
            SpanKind::Internal,
            cx,
            attributes,
        );

        let deliveries = match self.declare_queue(&setup_cx, queue).await {
            Ok(_) => {
                let options = ConsumeOptions {
                    consumer_tag: self.consumer_tag.clone(),
                    auto_ack: false,
                    exclusive: false,
                };
                self.client.consume(queue, options).await
            }
            Err(e) => Err(e),
        };
        let deliveries = match deliveries {
            Ok(deliveries) => deliveries,
            Err(e) => {
                record_failure(&setup_cx, &e);
                setup_cx.span().end();
                error!(queue, error = %e, "Failed to start consuming");
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(forward_deliveries(
            deliveries,
            tx,
            self.telemetry.clone(),
            setup_cx.clone(),
            shutdown,
            queue.to_string(),
        ));
        info!(queue, "Consuming messages");

        setup_cx.span().end();
        Ok(ReceiverStream::new(rx))
    }

    async fn ack(&self, cx: &Context, delivery: Delivery) -> Result<(), BrokerError> {
        let attributes = self.settle_attributes("ack", &delivery);
        let span_cx = self
            .telemetry
            .start_span(self.span_name("ack"), SpanKind::Internal, cx, attributes);

        let result = delivery.ack().await;
        if let Err(e) = &result {
            record_failure(&span_cx, e);
        }
        span_cx.span().end();
        result
    }

    async fn nack(&self, cx: &Context, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut attributes = self.settle_attributes("nack", &delivery);
        attributes.push(KeyValue::new(attr::MESSAGING_REQUEUE, requeue));
        let span_cx = self
            .telemetry
            .start_span(self.span_name("nack"), SpanKind::Internal, cx, attributes);

        let result = delivery.nack(requeue).await;
        if let Err(e) = &result {
            record_failure(&span_cx, e);
        }
        span_cx.span().end();
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.client.close().await
    }

    fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn system(&self) -> &'static str {
        self.client.system()
    }
}

/// Turn raw deliveries into [`Message`]s until the stream ends, the
/// receiving side goes away or shutdown is signalled.
///
/// Context is extracted per delivery. A delivery without trace metadata
/// inherits `base`, the consume-setup context.
async fn forward_deliveries(
    mut deliveries: DeliveryStream,
    tx: mpsc::Sender<Message>,
    telemetry: Telemetry,
    base: Context,
    mut shutdown: ShutdownReceiver,
    queue: String,
) {
    if shutdown::is_cancelled(&shutdown) {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut shutdown) => {
                debug!(queue = %queue, "Forwarding stopped by shutdown");
                break;
            }
            _ = tx.closed() => {
                debug!(queue = %queue, "Message receiver dropped");
                break;
            }
            next = deliveries.next() => next,
        };

        let mut delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Delivery stream failed");
                break;
            }
            None => {
                debug!(queue = %queue, "Delivery stream ended");
                break;
            }
        };

        let context = telemetry.extract_with_base(&base, &delivery.metadata);
        let message = Message {
            body: std::mem::take(&mut delivery.body),
            delivery,
            context,
        };

        tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut shutdown) => {
                debug!(queue = %queue, "Forwarding stopped by shutdown");
                break;
            }
            sent = tx.send(message) => {
                if sent.is_err() {
                    debug!(queue = %queue, "Message receiver dropped");
                    break;
                }
            }
        }
    }

    // Release the consumer before the message channel reports closed.
    drop(deliveries);
    drop(tx);
}
