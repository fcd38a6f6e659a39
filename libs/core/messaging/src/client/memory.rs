//! Process-local broker with AMQP-like delivery semantics.
//!
//! Used by tests and local runs without a RabbitMQ instance. Messages sent
//! through the default exchange are routed by queue name, handed to
//! consumers round-robin and tracked as unacked until settled. A negative
//! acknowledgement either puts the message back at the head of the queue
//! (flagged as redelivered) or moves it to the queue's dead letters.

use super::{
    Acker, BrokerClient, ConsumeOptions, Delivery, DeliveryStream, Envelope, PublishOptions,
    QueueInfo,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

struct Pending {
    envelope: Envelope,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Envelope>,
    dead_letters: Vec<Envelope>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
    next_consumer_id: u64,
    closed: bool,
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// In-memory [`BrokerClient`]. Cheap to clone; clones share all queues.
///
/// Deliveries must never be dropped while the state lock is held: an
/// unsettled delivery requeues itself on drop, which takes the lock.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages handed to a consumer and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Messages rejected without requeue, oldest first.
    pub fn dead_letters(&self, queue: &str) -> Vec<Envelope> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.queues.get_mut(queue).map_or(0, |q| {
            q.consumers.retain(|c| !c.tx.is_closed());
            q.consumers.len()
        })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        let envelope = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        let mut returned = Vec::new();
        if let Some(q) = state.queues.get_mut(queue) {
            match outcome {
                Settle::Ack => debug!(queue, delivery_tag = tag, "Delivery acked"),
                Settle::Requeue => {
                    debug!(queue, delivery_tag = tag, "Delivery requeued");
                    q.ready.push_front(Pending {
                        envelope,
                        redelivered: true,
                    });
                    returned = self.dispatch(&mut state, queue);
                }
                Settle::DeadLetter => {
                    debug!(queue, delivery_tag = tag, "Delivery dead-lettered");
                    q.dead_letters.push(envelope);
                }
            }
        }
        drop(state);
        drop(returned);
        Ok(())
    }

    /// Hand ready messages to live consumers until one side runs out.
    ///
    /// Returns deliveries whose receiver vanished mid-send. They are already
    /// back on the queue and marked settled; the caller drops them after
    /// releasing the lock.
    #[must_use]
    fn dispatch(&self, state: &mut State, queue: &str) -> Vec<Delivery> {
        let mut returned = Vec::new();
        let State {
            queues,
            next_delivery_tag,
            ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return returned;
        };

        loop {
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.consumers.is_empty() {
                break;
            }
            let Some(pending) = q.ready.pop_front() else {
                break;
            };
            let idx = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);
            let consumer = &q.consumers[idx];

            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;

            let acker: Arc<dyn Acker> = if consumer.auto_ack {
                Arc::new(SettledAcker(tag))
            } else {
                q.unacked.insert(tag, pending.envelope.clone());
                Arc::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue.to_string(),
                    delivery_tag: tag,
                })
            };
            let mut delivery = Delivery::new(tag, pending.envelope, acker)
                .with_routing("", queue)
                .with_consumer_tag(consumer.tag.clone())
                .with_redelivered(pending.redelivered);
            if consumer.auto_ack {
                delivery.mark_settled();
            }

            if let Err(mpsc::error::SendError(Ok(mut delivery))) = consumer.tx.send(Ok(delivery)) {
                q.unacked.remove(&tag);
                q.ready.push_front(Pending {
                    redelivered: delivery.redelivered,
                    envelope: delivery.take_envelope(),
                });
                delivery.mark_settled();
                returned.push(delivery);
            }
        }
        returned
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.settle(&self.queue, self.delivery_tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        };
        self.broker.settle(&self.queue, self.delivery_tag, outcome)
    }

    fn abandon(&self) {
        // Same as a consumer going away on a real broker: back to the queue.
        let _ = self
            .broker
            .settle(&self.queue, self.delivery_tag, Settle::Requeue);
    }
}

/// Acker for deliveries that were settled on receipt.
struct SettledAcker(u64);

#[async_trait]
impl Acker for SettledAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownDeliveryTag(self.0))
    }

    async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
        Err(BrokerError::UnknownDeliveryTag(self.0))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        let q = state.queues.entry(name.to_string()).or_default();
        q.consumers.retain(|c| !c.tx.is_closed());
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: q.ready.len() as u32,
            consumer_count: q.consumers.len() as u32,
        })
    }

    async fn publish(&self, options: PublishOptions, envelope: Envelope) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        if !options.exchange.is_empty() {
            return Err(BrokerError::Publish {
                routing_key: options.routing_key,
                reason: format!("no exchange '{}'", options.exchange),
            });
        }

        let Some(q) = state.queues.get_mut(&options.routing_key) else {
            if options.mandatory {
                return Err(BrokerError::Unroutable(options.routing_key));
            }
            warn!(routing_key = %options.routing_key, "Dropping unroutable message");
            return Ok(());
        };

        if options.immediate {
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.consumers.is_empty() {
                return Err(BrokerError::Unroutable(options.routing_key));
            }
        }

        q.ready.push_back(Pending {
            envelope,
            redelivered: false,
        });
        let returned = self.dispatch(&mut state, &options.routing_key);
        drop(state);
        drop(returned);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::ChannelClosed);
        }
        state.next_consumer_id += 1;
        let generated = format!("ctag-memory-{}", state.next_consumer_id);

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "queue not found".to_string(),
            });
        };
        q.consumers.retain(|c| !c.tx.is_closed());
        if options.exclusive && !q.consumers.is_empty() {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "queue already has consumers".to_string(),
            });
        }

        let tag = if options.consumer_tag.is_empty() {
            generated
        } else {
            options.consumer_tag
        };
        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            auto_ack: options.auto_ack,
            tx,
        });
        debug!(queue, consumer_tag = %tag, "Consumer registered");

        let returned = self.dispatch(&mut state, queue);
        drop(state);
        drop(returned);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        for q in state.queues.values_mut() {
            // Dropping the senders ends every consumer stream.
            q.consumers.clear();
        }
        debug!("In-memory broker closed");
        Ok(())
    }

    fn system(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("stream ended")
            .expect("delivery error")
    }

    async fn broker_with_queue(queue: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(queue).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(b"x".to_vec()))
            .await
            .unwrap();

        let info = broker.declare_queue("jobs").await.unwrap();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.consumer_count, 0);
    }

    #[tokio::test]
    async fn test_publish_then_consume_delivers_body_and_metadata() {
        let broker = broker_with_queue("jobs").await;
        let mut metadata = crate::client::Metadata::new();
        metadata.insert("traceparent".into(), "abc".into());
        broker
            .publish(
                PublishOptions::to_queue("jobs"),
                Envelope::new(b"hello".to_vec())
                    .with_metadata(metadata)
                    .with_message_id("m-1"),
            )
            .await
            .unwrap();

        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = next(&mut stream).await;

        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.metadata.get("traceparent").unwrap(), "abc");
        assert_eq!(delivery.message_id.as_deref(), Some("m-1"));
        assert_eq!(delivery.routing_key, "jobs");
        assert!(!delivery.redelivered);
        assert!(delivery.consumer_tag.starts_with("ctag-memory-"));
        assert_eq!(broker.unacked_count("jobs"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_second_ack_is_rejected() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![1]))
            .await
            .unwrap();
        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        let tag = delivery.delivery_tag;
        let acker = delivery.acker();
        delivery.ack().await.unwrap();

        let err = acker.ack().await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDeliveryTag(t) if t == tag));
        let err = acker.nack(false).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDeliveryTag(_)));
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![7]))
            .await
            .unwrap();
        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();

        next(&mut stream).await.nack(true).await.unwrap();

        let again = next(&mut stream).await;
        assert!(again.redelivered);
        assert_eq!(again.body, vec![7]);
        again.ack().await.unwrap();
        assert!(broker.dead_letters("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![9]))
            .await
            .unwrap();
        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();

        next(&mut stream).await.nack(false).await.unwrap();

        assert_eq!(broker.dead_letters("jobs").len(), 1);
        assert_eq!(broker.ready_count("jobs"), 0);
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_unroutable_publish() {
        let broker = InMemoryBroker::new();

        broker
            .publish(PublishOptions::to_queue("missing"), Envelope::new(vec![]))
            .await
            .unwrap();

        let mandatory = PublishOptions {
            mandatory: true,
            ..PublishOptions::to_queue("missing")
        };
        let err = broker.publish(mandatory, Envelope::new(vec![])).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable(q) if q == "missing"));
    }

    #[tokio::test]
    async fn test_immediate_without_consumers_fails() {
        let broker = broker_with_queue("jobs").await;
        let options = PublishOptions {
            immediate: true,
            ..PublishOptions::to_queue("jobs")
        };
        let err = broker.publish(options, Envelope::new(vec![])).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable(_)));
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = InMemoryBroker::new();
        let err = match broker.consume("nope", ConsumeOptions::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected consume error"),
        };
        assert!(matches!(err, BrokerError::Consume { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = broker_with_queue("jobs").await;
        let mut a = broker
            .consume("jobs", ConsumeOptions { consumer_tag: "a".into(), ..Default::default() })
            .await
            .unwrap();
        let mut b = broker
            .consume("jobs", ConsumeOptions { consumer_tag: "b".into(), ..Default::default() })
            .await
            .unwrap();

        for i in 0..4u8 {
            broker
                .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![i]))
                .await
                .unwrap();
        }

        let a1 = next(&mut a).await;
        let b1 = next(&mut b).await;
        let a2 = next(&mut a).await;
        let b2 = next(&mut b).await;
        assert_eq!((a1.body[0], b1.body[0], a2.body[0], b2.body[0]), (0, 1, 2, 3));
        assert_eq!(a1.consumer_tag, "a");
        assert_eq!(b1.consumer_tag, "b");
        for d in [a1, b1, a2, b2] {
            d.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_exclusive_consume_rejects_second_consumer() {
        let broker = broker_with_queue("jobs").await;
        let _first = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        let result = broker
            .consume("jobs", ConsumeOptions { exclusive: true, ..Default::default() })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![1]))
            .await
            .unwrap();
        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();

        drop(next(&mut stream).await);

        let again = next(&mut stream).await;
        assert!(again.redelivered);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_stream_returns_buffered_messages() {
        let broker = broker_with_queue("jobs").await;
        let stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![1]))
            .await
            .unwrap();
        assert_eq!(broker.unacked_count("jobs"), 1);

        drop(stream);

        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.ready_count("jobs"), 1);
        assert_eq!(broker.consumer_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_auto_ack_settles_on_receipt() {
        let broker = broker_with_queue("jobs").await;
        broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![1]))
            .await
            .unwrap();
        let mut stream = broker
            .consume("jobs", ConsumeOptions { auto_ack: true, ..Default::default() })
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(broker.unacked_count("jobs"), 0);
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_rejects_operations() {
        let broker = broker_with_queue("jobs").await;
        let mut stream = broker
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();

        broker.close().await.unwrap();

        let end = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
        let err = broker
            .publish(PublishOptions::to_queue("jobs"), Envelope::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ChannelClosed));
        // Closing twice is fine.
        broker.close().await.unwrap();
    }
}
