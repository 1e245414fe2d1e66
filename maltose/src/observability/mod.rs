//! Logging setup and per-request OpenTelemetry spans.

mod logging;
mod span;

pub use logging::TracingConfig;
pub use span::{HeaderExtractor, TRACE_ID_HEADER, TracingMiddleware};
pub(crate) use span::protocol_version;
