//! Trace-aware structured logger.
//!
//! A [`Logger`] is a handle on a `tracing` span plus the trace ids of the
//! request it serves. Records go through [`log_debug!`](crate::log_debug),
//! [`log_info!`](crate::log_info), [`log_warn!`](crate::log_warn) and
//! [`log_error!`](crate::log_error): they expand at the call site, so the
//! record's target is the caller's module, and they write `trace_id` and
//! `span_id` on the event itself. The ids therefore survive a level filter
//! that drops the logger's span.
//!
//! Decorating with trace ids creates a child span of the undecorated base;
//! the base is never touched.

use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};
use opentelemetry::Context;
use tracing::Span;

/// Correlation ids of the active span in a call context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceIds {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl TraceIds {
    /// `None` when the context carries no valid span context.
    pub fn from_context(cx: &Context) -> Option<Self> {
        let span = cx.span();
        let sc = span.span_context();
        sc.is_valid().then(|| Self {
            trace_id: sc.trace_id(),
            span_id: sc.span_id(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Logger {
    base: Span,
    span: Span,
    trace: Option<TraceIds>,
}

impl Logger {
    /// Base logger tagged with `component`.
    pub fn new(component: &str) -> Self {
        Self::from_span(tracing::info_span!("logger", component = %component))
    }

    pub fn from_span(span: Span) -> Self {
        Self {
            base: span.clone(),
            span,
            trace: None,
        }
    }

    /// Logger whose records carry `trace_id` and `span_id` from `cx`.
    ///
    /// Always derived from the undecorated base, so ids never accumulate across
    /// calls. Without an active span in `cx` this is the base logger.
    pub fn with_trace(&self, cx: &Context) -> Self {
        match TraceIds::from_context(cx) {
            Some(ids) => Self {
                base: self.base.clone(),
                span: tracing::info_span!(
                    parent: &self.base,
                    "trace",
                    trace_id = %ids.trace_id,
                    span_id = %ids.span_id,
                ),
                trace: Some(ids),
            },
            None => Self::from_span(self.base.clone()),
        }
    }

    pub fn trace_ids(&self) -> Option<TraceIds> {
        self.trace
    }

    /// The span records are emitted in; use it to instrument futures.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn in_scope<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.span.in_scope(f)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("ctlplane")
    }
}

/// Emit a record through a [`Logger`] at `level`.
///
/// Runs inside the logger's span and adds `trace_id`/`span_id` when the
/// logger carries them. The target is the module that invokes the macro.
#[macro_export]
macro_rules! log_event {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger: &$crate::telemetry::Logger = &$logger;
        let ids = logger.trace_ids();
        logger.in_scope(|| {
            $crate::__private::tracing::event!(
                $level,
                trace_id = ids.map(|t| $crate::__private::tracing::field::display(t.trace_id)),
                span_id = ids.map(|t| $crate::__private::tracing::field::display(t.span_id)),
                $($arg)+
            )
        })
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_event!($logger, $crate::__private::tracing::Level::DEBUG, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_event!($logger, $crate::__private::tracing::Level::INFO, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_event!($logger, $crate::__private::tracing::Level::WARN, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_event!($logger, $crate::__private::tracing::Level::ERROR, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{remote_context, CaptureWriter};

    #[test]
    fn trace_ids_absent_in_empty_context() {
        assert!(TraceIds::from_context(&Context::new()).is_none());
    }

    #[test]
    fn trace_ids_read_from_remote_span_context() {
        let cx = remote_context(0xabc, 0x12);
        let ids = TraceIds::from_context(&cx).unwrap();
        assert_eq!(ids.trace_id.to_string(), format!("{:032x}", 0xabc));
        assert_eq!(ids.span_id.to_string(), format!("{:016x}", 0x12));
    }

    #[test]
    fn decorated_records_carry_trace_fields() {
        let capture = CaptureWriter::default();
        tracing::subscriber::with_default(capture.subscriber(), || {
            let base = Logger::new("devices");
            let log = base.with_trace(&remote_context(0x1111, 0x22));
            crate::log_info!(log, "created device");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(&format!("{:032x}", 0x1111)));
        assert!(lines[0].contains(&format!("{:016x}", 0x22)));
        assert!(lines[0].contains("created device"));
        assert!(lines[0].contains("devices"));
    }

    #[test]
    fn decoration_does_not_accumulate() {
        let capture = CaptureWriter::default();
        tracing::subscriber::with_default(capture.subscriber(), || {
            let base = Logger::new("devices");
            let first = base.with_trace(&remote_context(0xaaaa, 0x1));
            let second = first.with_trace(&remote_context(0xbbbb, 0x2));
            assert_eq!(second.trace_ids(), TraceIds::from_context(&remote_context(0xbbbb, 0x2)));
            crate::log_warn!(second, "second only");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(&format!("{:032x}", 0xbbbb)));
        assert!(!lines[0].contains(&format!("{:032x}", 0xaaaa)));
    }

    #[test]
    fn no_trace_means_base_logger() {
        let capture = CaptureWriter::default();
        tracing::subscriber::with_default(capture.subscriber(), || {
            let base = Logger::new("devices");
            let log = base.with_trace(&Context::new());
            assert!(log.trace_ids().is_none());
            crate::log_info!(log, "plain record");
            crate::log_info!(base, "plain record");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].contains("trace_id"));
        assert_eq!(strip_timestamp(&lines[0]), strip_timestamp(&lines[1]));
    }

    #[test]
    fn trace_fields_survive_a_warn_filter() {
        let capture = CaptureWriter::default();
        tracing::subscriber::with_default(capture.subscriber_with("warn"), || {
            let log = Logger::new("api").with_trace(&remote_context(0x1111, 0x22));
            crate::log_info!(log, "filtered out");
            crate::log_error!(log, "db down");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record["fields"]["message"], "db down");
        assert_eq!(record["fields"]["trace_id"], format!("{:032x}", 0x1111));
        assert_eq!(record["fields"]["span_id"], format!("{:016x}", 0x22));
    }

    #[test]
    fn records_accept_structured_fields() {
        let capture = CaptureWriter::default();
        tracing::subscriber::with_default(capture.subscriber(), || {
            let log = Logger::new("devices");
            crate::log_debug!(log, device = "edge-1", "flag {} is {}", "vpc", true);
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record["fields"]["device"], "edge-1");
        assert_eq!(record["fields"]["message"], "flag vpc is true");
        assert!(record["fields"].get("trace_id").is_none());
        assert_eq!(record["target"], "ctlplane::telemetry::logger::tests");
    }

    fn strip_timestamp(line: &str) -> serde_json::Value {
        let mut v: serde_json::Value = serde_json::from_str(line).unwrap();
        if let Some(obj) = v.as_object_mut() {
            obj.remove("timestamp");
        }
        v
    }
}
