//! Runs against a real RabbitMQ in Docker. `cargo test -- --ignored` to run.

use amqp_worker::{AmqpClient, AmqpConfig};
use futures::StreamExt;
use messaging::telemetry::{attributes as attr, spans};
use messaging::testing::SpanCapture;
use messaging::{
    BrokerClient, ConsumeOptions, Envelope, JobProcessor, MessageBroker, NoOpHandler,
    PublishOptions, TracedBroker,
};
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_utils::{TestDataBuilder, TestRabbitMq};

fn config(rabbit: &TestRabbitMq) -> AmqpConfig {
    AmqpConfig::new(rabbit.host.clone(), rabbit.port)
        .with_credentials(rabbit.user.clone(), rabbit.password.clone())
}

async fn wait_for(capture: &SpanCapture, name: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while capture.spans_named(name).len() < count {
        assert!(Instant::now() < deadline, "timed out waiting for {name}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_consume_ack_roundtrip() {
    let rabbit = TestRabbitMq::new().await;
    let client = AmqpClient::connect(&config(&rabbit)).await.unwrap();
    let queue = TestDataBuilder::from_test_name("roundtrip").name("queue", "raw");

    let info = client.declare_queue(&queue).await.unwrap();
    assert_eq!(info.name, queue);
    assert_eq!(info.message_count, 0);

    let mut metadata = messaging::Metadata::new();
    metadata.insert(
        "traceparent".to_string(),
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
    );
    client
        .publish(
            PublishOptions::to_queue(&queue),
            Envelope::new(b"hello".to_vec())
                .with_metadata(metadata.clone())
                .with_message_id("m-1"),
        )
        .await
        .unwrap();

    let mut deliveries = client.consume(&queue, ConsumeOptions::default()).await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    assert_eq!(first.body, b"hello");
    assert_eq!(first.metadata, metadata);
    assert_eq!(first.message_id.as_deref(), Some("m-1"));
    assert!(!first.redelivered);

    // Requeue once, then ack the redelivery.
    first.nack(true).await.unwrap();
    let second = deliveries.next().await.unwrap().unwrap();
    assert!(second.redelivered);
    second.ack().await.unwrap();

    client.close().await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unroutable_mandatory_publish() {
    let rabbit = TestRabbitMq::new().await;
    let client = AmqpClient::connect(&config(&rabbit)).await.unwrap();

    let mut options = PublishOptions::to_queue("no-such-queue");
    options.mandatory = true;
    let err = client
        .publish(options, Envelope::new(b"x".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, messaging::BrokerError::Unroutable(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_trace_context_crosses_rabbitmq() {
    let rabbit = TestRabbitMq::new().await;
    let capture = SpanCapture::new();
    let client = AmqpClient::connect(&config(&rabbit)).await.unwrap();
    let queue = TestDataBuilder::from_test_name("trace").name("queue", "email");

    let broker = Arc::new(TracedBroker::new(client, capture.telemetry()));
    let processor = JobProcessor::new(broker.clone());
    processor.register_handler("email", NoOpHandler).unwrap();
    processor.start_consumer(&Context::new(), &queue).await.unwrap();

    let telemetry = capture.telemetry();
    let request = telemetry.start_span("send-email", SpanKind::Server, &Context::new(), vec![]);
    processor
        .publish_job(&request, &queue, "email", json!({"to": "a@b.com"}))
        .await
        .unwrap();
    processor
        .publish_job(&Context::new(), &queue, "sms", json!({}))
        .await
        .unwrap();
    request.span().end();

    wait_for(&capture, spans::PROCESS_JOB, 2).await;

    let publish = capture
        .spans_named("rabbitmq.publish")
        .into_iter()
        .find(|span| span.parent_span_id == capture.span("send-email").span_context.span_id())
        .unwrap();
    let processed = capture.spans_named(spans::PROCESS_JOB);
    let email = processed
        .iter()
        .find(|span| SpanCapture::attribute(span, attr::JOB_TYPE).as_deref() == Some("email"))
        .unwrap();
    assert_eq!(email.parent_span_id, publish.span_context.span_id());
    assert_eq!(email.span_context.trace_id(), publish.span_context.trace_id());
    assert_eq!(SpanCapture::attribute(email, attr::JOB_STATUS).as_deref(), Some("complete"));

    let sms = processed
        .iter()
        .find(|span| SpanCapture::attribute(span, attr::JOB_TYPE).as_deref() == Some("sms"))
        .unwrap();
    assert!(SpanCapture::has_exception(sms));

    wait_for(&capture, "rabbitmq.ack", 1).await;
    wait_for(&capture, "rabbitmq.nack", 1).await;

    processor.shutdown().await;
    broker.close().await.unwrap();
}
