//! Obtaining the call context that carries the active trace.

use http::HeaderMap;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::{global, Context};

/// Context of the current `tracing` span.
///
/// With the OpenTelemetry bridge installed this carries the span's trace and
/// span ids; otherwise it is the thread's ambient OpenTelemetry context.
pub fn current_context() -> Context {
    #[cfg(feature = "otel")]
    {
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        tracing::Span::current().context()
    }
    #[cfg(not(feature = "otel"))]
    {
        Context::current()
    }
}

/// Context propagated by a caller through request headers, using the globally
/// installed propagator.
pub fn extract_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

pub fn extract_context_with<P>(propagator: &P, headers: &HeaderMap) -> Context
where
    P: TextMapPropagator + ?Sized,
{
    propagator.extract(&HeaderExtractor(headers))
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}
