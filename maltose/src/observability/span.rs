use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use opentelemetry::propagation::Extractor;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{
    FutureExt, Span, SpanContext, SpanKind, Status, TraceContextExt, Tracer,
};
use opentelemetry::KeyValue;

use crate::middleware::{BoxFuture, Middleware, Next, run_guarded};
use crate::request::Request;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

const TRACER_NAME: &str = "maltose";

/// Reads propagation fields from request headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Opens a server span per request and echoes the trace id in `x-trace-id`.
///
/// The rest of the chain runs with the span as the current OpenTelemetry
/// context, and handlers see it through
/// [`RequestContext::otel_context`](crate::context::RequestContext::otel_context).
/// With the default no-op provider the span records nothing, and the trace id
/// comes from the incoming `x-trace-id` header or a fresh UUID.
#[derive(Debug, Default)]
pub struct TracingMiddleware {
    tracer: Option<BoxedTracer>,
}

impl TracingMiddleware {
    /// Uses the global tracer provider.
    pub fn new() -> Self {
        Self { tracer: None }
    }

    /// Uses `tracer` instead of the global provider.
    pub fn with_tracer(tracer: BoxedTracer) -> Self {
        Self {
            tracer: Some(tracer),
        }
    }
}

impl Middleware for TracingMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let parent = global::get_text_map_propagator(|propagator| {
                propagator.extract(&HeaderExtractor(req.headers()))
            });
            let route = req.route().unwrap_or(req.path()).to_string();
            let global_tracer;
            let tracer = match &self.tracer {
                Some(tracer) => tracer,
                None => {
                    global_tracer = global::tracer(TRACER_NAME);
                    &global_tracer
                }
            };
            let span = tracer
                .span_builder(format!("HTTP {} {}", req.method(), route))
                .with_kind(SpanKind::Server)
                .start_with_context(tracer, &parent);

            let trace_id = resolve_trace_id(span.span_context(), req.headers());
            let cx = parent.with_span(span);
            let ctx = req.context_mut();
            ctx.trace_id = trace_id.clone();
            ctx.set_otel_context(cx.clone());
            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                req.response()
                    .insert_header(HeaderName::from_static(TRACE_ID_HEADER), value);
            }

            run_guarded(next, &mut *req)
                .with_context(cx.clone())
                .await;

            let span = cx.span();
            span.set_attributes(request_attributes(req, &route));
            span.set_attribute(KeyValue::new(
                "http.response.status_code",
                i64::from(req.status().as_u16()),
            ));
            if !req.errors().is_empty() {
                for err in req.errors() {
                    span.record_error(err);
                }
                let messages = req
                    .errors()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                span.set_status(Status::error(messages));
            }
            span.end();
        })
    }
}

/// Valid OpenTelemetry trace id, then the incoming header, then a new UUID.
fn resolve_trace_id(context: &SpanContext, headers: &HeaderMap) -> String {
    if context.is_valid() {
        return context.trace_id().to_string();
    }
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn request_attributes(req: &Request, route: &str) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("http.request.method", req.method().to_string()),
        KeyValue::new("url.full", req.uri().to_string()),
        KeyValue::new("url.scheme", req.scheme()),
        KeyValue::new(
            "network.protocol.version",
            protocol_version(req.version()),
        ),
        KeyValue::new("http.route", route.to_string()),
    ];
    if let Some(host) = req.host() {
        attributes.push(KeyValue::new("server.address", host.to_string()));
    }
    attributes
}

pub(crate) fn protocol_version(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "0.9",
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_2 => "2",
        http::Version::HTTP_3 => "3",
        _ => "1.1",
    }
}
