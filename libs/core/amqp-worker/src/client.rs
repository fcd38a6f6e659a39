//! [`BrokerClient`] over a lapin connection.

use crate::config::AmqpConfig;
use crate::headers::{from_field_table, to_field_table};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker as LapinAckHandle;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use messaging::{
    Acker, BrokerClient, BrokerError, ConsumeOptions, Delivery, DeliveryStream, Envelope,
    PublishOptions, QueueInfo,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

/// One connection and one confirm-mode channel to RabbitMQ.
///
/// Publishes wait for the broker's confirm, so a successful
/// [`publish`](BrokerClient::publish) means RabbitMQ has taken the message.
pub struct AmqpClient {
    connection: Connection,
    channel: Channel,
    durable_queues: bool,
}

impl AmqpClient {
    /// Connect, open a channel and put it in confirm mode.
    pub async fn connect(config: &AmqpConfig) -> Result<Self, BrokerError> {
        info!(url = %config.redacted_url(), "Connecting to RabbitMQ");
        let connection = Connection::connect(&config.url(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        info!(channel_id = channel.id(), "Connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
            durable_queues: config.durable_queues,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

fn envelope_properties(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT)
        .with_headers(to_field_table(&envelope.metadata));
    if let Some(id) = &envelope.message_id {
        properties = properties.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    properties
}

fn into_delivery(delivery: lapin::message::Delivery, consumer_tag: &str) -> Delivery {
    let properties = delivery.properties;
    let envelope = Envelope {
        body: delivery.data,
        metadata: from_field_table(properties.headers().as_ref()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
    };
    let acker = LapinAcker {
        handle: delivery.acker,
        delivery_tag: delivery.delivery_tag,
    };

    Delivery::new(delivery.delivery_tag, envelope, Arc::new(acker))
        .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str())
        .with_consumer_tag(consumer_tag)
        .with_redelivered(delivery.redelivered)
}

struct LapinAcker {
    handle: LapinAckHandle,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.handle
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.handle
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }

    // Unsettled deliveries go back to the queue when the channel closes.
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: self.durable_queues,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            queue = name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(&self, options: PublishOptions, envelope: Envelope) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            routing_key: options.routing_key.clone(),
            reason,
        };

        let confirm = self
            .channel
            .basic_publish(
                &options.exchange,
                &options.routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                &envelope.body,
                envelope_properties(&envelope),
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        match confirm {
            Confirmation::Ack(Some(_returned)) => {
                Err(BrokerError::Unroutable(options.routing_key.clone()))
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(publish_error("broker nacked the message".to_string())),
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let consumer_tag = consumer.tag().as_str().to_string();
        info!(queue, consumer_tag = %consumer_tag, "Consumer registered");

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(into_delivery(delivery, &consumer_tag)),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Consumer stream error");
                Err(BrokerError::Consume {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        info!("RabbitMQ connection closed");
        Ok(())
    }

    fn system(&self) -> &'static str {
        "rabbitmq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::Metadata;

    #[test]
    fn test_envelope_properties() {
        let mut metadata = Metadata::new();
        metadata.insert("traceparent".to_string(), "00-abc-def-01".to_string());
        let envelope = Envelope::new(b"{}".to_vec())
            .with_metadata(metadata.clone())
            .with_message_id("msg-1")
            .with_correlation_id("conv-1");

        let properties = envelope_properties(&envelope);
        assert_eq!(properties.content_type().as_ref().map(|s| s.as_str()), Some(CONTENT_TYPE));
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(properties.message_id().as_ref().map(|s| s.as_str()), Some("msg-1"));
        assert_eq!(properties.correlation_id().as_ref().map(|s| s.as_str()), Some("conv-1"));
        assert_eq!(from_field_table(properties.headers().as_ref()), metadata);
    }

    #[test]
    fn test_envelope_properties_without_ids() {
        let properties = envelope_properties(&Envelope::new(Vec::new()));
        assert!(properties.message_id().is_none());
        assert!(properties.correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Nothing listens on port 1.
        let config = AmqpConfig::new("127.0.0.1", 1);
        let err = match AmqpClient::connect(&config).await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}
