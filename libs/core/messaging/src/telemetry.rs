//! Tracer and propagator handed to the broker and the processor.
//!
//! Nothing in this crate reads the OpenTelemetry globals; callers build a
//! [`Telemetry`] from whatever provider they run and pass it in.

use crate::carrier;
use crate::client::Metadata;
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{noop::NoopTracer, SpanKind, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Instrumentation scope name used when building a tracer from a provider.
pub const INSTRUMENTATION_NAME: &str = "messaging";

/// Span attribute keys shared by the broker and the processor.
pub mod attributes {
    pub const MESSAGING_SYSTEM: &str = "messaging.system";
    pub const MESSAGING_DESTINATION: &str = "messaging.destination";
    pub const MESSAGING_DESTINATION_KIND: &str = "messaging.destination_kind";
    pub const MESSAGING_PROTOCOL: &str = "messaging.protocol";
    pub const MESSAGING_PROTOCOL_VERSION: &str = "messaging.protocol_version";
    pub const MESSAGING_OPERATION: &str = "messaging.operation";
    pub const MESSAGING_MESSAGE_SIZE: &str = "messaging.message_size";
    pub const MESSAGING_MESSAGE_ID: &str = "messaging.message_id";
    pub const MESSAGING_CONVERSATION_ID: &str = "messaging.conversation_id";
    pub const MESSAGING_ROUTING_KEY: &str = "messaging.rabbitmq.routing_key";
    pub const MESSAGING_EXCHANGE: &str = "messaging.rabbitmq.exchange";
    pub const MESSAGING_CONSUMER_TAG: &str = "messaging.rabbitmq.consumer_tag";
    pub const MESSAGING_DELIVERY_TAG: &str = "messaging.rabbitmq.delivery_tag";
    pub const MESSAGING_REQUEUE: &str = "messaging.rabbitmq.requeue";
    pub const MESSAGING_REDELIVERED: &str = "messaging.rabbitmq.redelivered";
    pub const MESSAGING_QUEUE: &str = "messaging.rabbitmq.queue";

    pub const JOB_ID: &str = "job.id";
    pub const JOB_TYPE: &str = "job.type";
    pub const JOB_STATUS: &str = "job.status";
    pub const JOB_ATTEMPT: &str = "job.attempt";
    pub const JOB_ERROR: &str = "job.error";
    pub const JOB_REQUEUE_POLICY: &str = "job.requeue_policy";
}

/// Span names that don't depend on the transport.
pub mod spans {
    pub const PROCESS_JOB: &str = "process.job";
    pub const EXECUTE_HANDLER: &str = "execute.handler";
}

/// Tracer plus text-map propagator.
#[derive(Clone)]
pub struct Telemetry {
    tracer: Arc<BoxedTracer>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Telemetry {
    pub fn new(
        tracer: BoxedTracer,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        Self {
            tracer: Arc::new(tracer),
            propagator: Arc::new(propagator),
        }
    }

    /// Tracer from `provider` with the W3C trace-context + baggage propagator.
    pub fn from_provider<P>(provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        let tracer = BoxedTracer::new(Box::new(provider.tracer(INSTRUMENTATION_NAME)));
        Self::new(tracer, default_propagator())
    }

    /// Records nothing, still propagates whatever context it is given.
    pub fn noop() -> Self {
        Self::new(BoxedTracer::new(Box::new(NoopTracer::new())), default_propagator())
    }

    pub fn with_propagator(mut self, propagator: impl TextMapPropagator + Send + Sync + 'static) -> Self {
        self.propagator = Arc::new(propagator);
        self
    }

    pub fn tracer(&self) -> &BoxedTracer {
        &self.tracer
    }

    pub fn propagator(&self) -> &(dyn TextMapPropagator + Send + Sync) {
        self.propagator.as_ref()
    }

    /// Serialize `cx` into a fresh metadata map.
    pub fn inject(&self, cx: &Context) -> Metadata {
        carrier::inject_context(self.propagator.as_ref(), cx)
    }

    pub fn extract(&self, metadata: &Metadata) -> Context {
        carrier::extract_context(self.propagator.as_ref(), metadata)
    }

    /// Like [`extract`](Self::extract), but keys absent from `metadata` leave
    /// `base` in place instead of yielding an empty context.
    pub fn extract_with_base(&self, base: &Context, metadata: &Metadata) -> Context {
        self.propagator
            .extract_with_context(base, &carrier::MetadataExtractor(metadata))
    }

    /// Start a span as a child of `parent` and return the context holding it.
    pub fn start_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &Context,
        attributes: Vec<KeyValue>,
    ) -> Context {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(self.tracer.as_ref(), parent);
        parent.with_span(span)
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("fields", &self.propagator.fields().collect::<Vec<_>>())
            .finish()
    }
}

fn default_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SpanCapture;
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    #[test]
    fn test_default_propagator_fields() {
        let telemetry = Telemetry::noop();
        let fields: Vec<_> = telemetry.propagator().fields().collect();
        assert!(fields.contains(&"traceparent"));
        assert!(fields.contains(&"baggage"));
    }

    #[test]
    fn test_noop_still_propagates_remote_context() {
        let telemetry = Telemetry::noop();
        let remote = SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let cx = Context::new().with_remote_span_context(remote.clone());

        let metadata = telemetry.inject(&cx);
        let restored = telemetry.extract(&metadata);
        assert_eq!(restored.span().span_context().trace_id(), remote.trace_id());
    }

    #[test]
    fn test_start_span_is_child_of_parent() {
        let capture = SpanCapture::new();
        let telemetry = capture.telemetry();

        let parent = telemetry.start_span("parent", SpanKind::Internal, &Context::new(), vec![]);
        let child = telemetry.start_span(
            "child",
            SpanKind::Consumer,
            &parent,
            vec![KeyValue::new(attributes::JOB_TYPE, "email")],
        );
        child.span().end();
        parent.span().end();

        let child = capture.span("child");
        let parent = capture.span("parent");
        assert_eq!(child.parent_span_id, parent.span_context.span_id());
        assert_eq!(child.span_kind, SpanKind::Consumer);
        assert_eq!(
            SpanCapture::attribute(&child, attributes::JOB_TYPE).as_deref(),
            Some("email")
        );
    }
}
