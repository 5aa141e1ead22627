//! Trace context propagation through envelope metadata.
//!
//! Publishers write the W3C `traceparent` of their publish span into the
//! envelope's `otelTraceHeader` map. Consumers read it back and parent their
//! handler spans on it, so one trace follows a message across replicas.

use std::collections::HashMap;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Carrier key of the W3C trace context header.
pub const TRACEPARENT: &str = "traceparent";

/// Write `span`'s context into `carrier` unless it already carries one.
///
/// Nothing is written when no OpenTelemetry layer is installed.
pub fn inject_span(span: &Span, carrier: &mut HashMap<String, String>) {
    if carrier.contains_key(TRACEPARENT) {
        return;
    }
    TraceContextPropagator::new().inject_context(&span.context(), carrier);
}

/// Read the remote parent context from `carrier`.
///
/// Returns `None` if the header is missing or malformed.
pub fn extract_parent(carrier: &HashMap<String, String>) -> Option<Context> {
    let cx = TraceContextPropagator::new().extract(carrier);
    cx.span().span_context().is_valid().then_some(cx)
}

/// Hex trace id of `cx`, if it holds a valid span context.
pub fn trace_id(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn carrier(value: &str) -> HashMap<String, String> {
        HashMap::from([(TRACEPARENT.to_string(), value.to_string())])
    }

    #[test]
    fn test_extract_known_header() {
        let cx = extract_parent(&carrier(HEADER)).unwrap();
        assert_eq!(
            trace_id(&cx).as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert!(extract_parent(&HashMap::new()).is_none());
        assert!(extract_parent(&carrier("")).is_none());
        assert!(extract_parent(&carrier(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        ))
        .is_none());
    }

    #[test]
    fn test_inject_keeps_existing_header() {
        let mut map = carrier(HEADER);
        inject_span(&Span::none(), &mut map);
        assert_eq!(map[TRACEPARENT], HEADER);
    }

    #[test]
    fn test_inject_without_layer_writes_nothing() {
        let mut map = HashMap::new();
        inject_span(&Span::none(), &mut map);
        assert!(map.is_empty());
    }
}
