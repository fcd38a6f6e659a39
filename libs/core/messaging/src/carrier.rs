//! Trace-context carrier over message metadata.
//!
//! The propagator writes and reads through these adapters; they borrow the
//! metadata map and never copy it.

use crate::client::Metadata;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;

/// Write view over a message's metadata map.
pub struct MetadataInjector<'a>(pub &'a mut Metadata);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Read view over a message's metadata map.
pub struct MetadataExtractor<'a>(pub &'a Metadata);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Inject `cx` into a freshly allocated metadata map.
pub fn inject_context(propagator: &dyn TextMapPropagator, cx: &Context) -> Metadata {
    let mut metadata = Metadata::new();
    propagator.inject_context(cx, &mut MetadataInjector(&mut metadata));
    metadata
}

/// Extract a context from `metadata`. Missing or malformed keys yield an
/// empty context, never an error.
pub fn extract_context(propagator: &dyn TextMapPropagator, metadata: &Metadata) -> Context {
    propagator.extract(&MetadataExtractor(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    fn sampled_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn test_get_missing_key_returns_none() {
        let metadata = Metadata::new();
        assert_eq!(MetadataExtractor(&metadata).get("traceparent"), None);
    }

    #[test]
    fn test_set_then_get() {
        let mut metadata = Metadata::new();
        MetadataInjector(&mut metadata).set("traceparent", "value".into());
        assert_eq!(MetadataExtractor(&metadata).get("traceparent"), Some("value"));
    }

    #[test]
    fn test_keys_lists_every_entry() {
        let mut metadata = Metadata::new();
        metadata.insert("a".into(), "1".into());
        metadata.insert("b".into(), "2".into());

        let extractor = MetadataExtractor(&metadata);
        let mut keys = extractor.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_inject_writes_traceparent() {
        let propagator = TraceContextPropagator::new();
        let metadata = inject_context(&propagator, &sampled_context());

        assert_eq!(
            metadata.get("traceparent").map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }

    #[test]
    fn test_extract_restores_span_context() {
        let propagator = TraceContextPropagator::new();
        let metadata = inject_context(&propagator, &sampled_context());

        let cx = extract_context(&propagator, &metadata);
        let span = cx.span();
        let restored = span.span_context();
        assert!(restored.is_valid());
        assert!(restored.is_remote());
        assert_eq!(
            restored.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
    }

    #[test]
    fn test_extract_from_empty_metadata_is_empty_context() {
        let propagator = TraceContextPropagator::new();
        let cx = extract_context(&propagator, &Metadata::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_inject_without_active_span_leaves_map_empty() {
        let propagator = TraceContextPropagator::new();
        let metadata = inject_context(&propagator, &Context::new());
        assert!(metadata.is_empty());
    }
}
