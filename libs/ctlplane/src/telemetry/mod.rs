//! Tracing backend glue: OTLP setup, trace-context extraction, span guards
//! and the trace-aware logger.

pub mod context;
pub mod init;
pub mod logger;
pub mod span;

pub use context::{current_context, extract_context, extract_context_with};
pub use logger::{Logger, TraceIds};
pub use span::SpanGuard;
