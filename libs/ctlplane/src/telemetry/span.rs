use std::borrow::Cow;

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::Context;

/// Ends the wrapped span when dropped, on every exit path of the owning scope.
#[must_use = "the span ends as soon as the guard is dropped"]
pub struct SpanGuard<S: Span> {
    span: S,
}

impl<S: Span> SpanGuard<S> {
    /// Start `name` as a child of whatever span `parent` carries.
    pub fn start<T>(tracer: &T, name: impl Into<Cow<'static, str>>, parent: &Context) -> Self
    where
        T: Tracer<Span = S>,
    {
        Self {
            span: tracer.start_with_context(name, parent),
        }
    }

    pub fn span_mut(&mut self) -> &mut S {
        &mut self.span
    }
}

impl<S: Span> Drop for SpanGuard<S> {
    fn drop(&mut self) {
        self.span.end();
    }
}
