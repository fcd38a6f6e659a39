//! Span capture for tests.
//!
//! Builds an SDK tracer provider that exports synchronously into memory, so
//! a test can inspect every finished span right after the code under test
//! ends it.

use crate::telemetry::Telemetry;
use opentelemetry::trace::SpanId;
use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};

pub struct SpanCapture {
    exporter: InMemorySpanExporter,
    provider: SdkTracerProvider,
}

impl SpanCapture {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Self { exporter, provider }
    }

    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry::from_provider(&self.provider)
    }

    /// Every span ended so far, in end order.
    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap_or_default()
    }

    pub fn spans_named(&self, name: &str) -> Vec<SpanData> {
        self.spans()
            .into_iter()
            .filter(|span| span.name == name)
            .collect()
    }

    /// The single finished span called `name`.
    ///
    /// # Panics
    ///
    /// If there isn't exactly one.
    pub fn span(&self, name: &str) -> SpanData {
        let mut found = self.spans_named(name);
        assert_eq!(
            found.len(),
            1,
            "expected exactly one span named {name:?}, got {}: {:?}",
            found.len(),
            self.names()
        );
        found.remove(0)
    }

    pub fn names(&self) -> Vec<String> {
        self.spans().iter().map(|span| span.name.to_string()).collect()
    }

    /// The finished span whose id is `id`, if any.
    pub fn by_id(&self, id: SpanId) -> Option<SpanData> {
        self.spans()
            .into_iter()
            .find(|span| span.span_context.span_id() == id)
    }

    pub fn reset(&self) {
        self.exporter.reset();
    }

    /// String form of attribute `key` on `span`.
    pub fn attribute(span: &SpanData, key: &str) -> Option<String> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| value_to_string(&kv.value))
    }

    /// Every value recorded for `key` on `span`, in the order they were set.
    pub fn attribute_values(span: &SpanData, key: &str) -> Vec<String> {
        span.attributes
            .iter()
            .filter(|kv| kv.key.as_str() == key)
            .map(|kv| value_to_string(&kv.value))
            .collect()
    }

    /// Whether an `exception` event was recorded on `span`.
    pub fn has_exception(span: &SpanData) -> bool {
        span.events.events.iter().any(|event| event.name == "exception")
    }
}

impl Default for SpanCapture {
    fn default() -> Self {
        Self::new()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().to_string(),
        other => other.to_string(),
    }
}
