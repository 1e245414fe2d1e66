use std::net::SocketAddr;
use std::time::Instant;

use http::{HeaderMap, Method, Uri, Version};

use crate::response::ResponseWriter;

/// Handler-facing view of the current request.
///
/// Cheap to clone; the response writer is shared with the pipeline, so a
/// handler that writes through it short-circuits the response envelope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub start_time: Instant,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    route: Option<String>,
    remote_addr: Option<SocketAddr>,
    response: ResponseWriter,
    otel: opentelemetry::Context,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_trace_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_trace_id(trace_id: String) -> Self {
        Self {
            trace_id,
            start_time: Instant::now(),
            method: Method::GET,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            route: None,
            remote_addr: None,
            response: ResponseWriter::new(),
            otel: opentelemetry::Context::new(),
        }
    }

    pub(crate) fn from_parts(parts: &http::request::Parts, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            remote_addr,
            ..Self::new()
        }
    }

    pub(crate) fn set_route(&mut self, route: Option<String>) {
        self.route = route;
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub(crate) fn set_otel_context(&mut self, cx: opentelemetry::Context) {
        self.otel = cx;
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A request header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The matched route pattern, e.g. `/user/:id`.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The OpenTelemetry context holding the request's server span. Spans
    /// started with it as parent join the request trace.
    pub fn otel_context(&self) -> &opentelemetry::Context {
        &self.otel
    }

    /// The response writer shared with the pipeline.
    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_generates_uuid() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.trace_id.len(), 36);
        assert!(ctx.trace_id.chars().filter(|c| *c == '-').count() == 4);
    }

    #[test]
    fn test_new_generates_unique_ids() {
        let ctx1 = RequestContext::new();
        let ctx2 = RequestContext::new();
        assert_ne!(ctx1.trace_id, ctx2.trace_id);
    }

    #[test]
    fn test_elapsed_increases() {
        let ctx = RequestContext::new();
        let elapsed1 = ctx.elapsed();
        thread::sleep(Duration::from_millis(10));
        let elapsed2 = ctx.elapsed();
        assert!(elapsed2 > elapsed1);
    }

    #[test]
    fn test_from_parts_copies_request_line() {
        let (parts, _) = http::Request::builder()
            .method(Method::POST)
            .uri("/user/7?x=1")
            .header("x-token", "abc")
            .body(())
            .unwrap()
            .into_parts();
        let ctx = RequestContext::from_parts(&parts, None);
        assert_eq!(ctx.method(), Method::POST);
        assert_eq!(ctx.uri().path(), "/user/7");
        assert_eq!(ctx.header("x-token"), Some("abc"));
        assert_eq!(ctx.route(), None);
    }

    #[test]
    fn test_clone_shares_response_writer() {
        let ctx = RequestContext::new();
        let copy = ctx.clone();
        copy.response()
            .write(http::StatusCode::CREATED, "text/plain", "done");
        assert!(ctx.response().is_written());
        assert_eq!(ctx.trace_id, copy.trace_id);
    }
}
