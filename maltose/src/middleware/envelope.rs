use crate::request::Request;
use crate::response::{ResponsePolicy, materialize};

use super::{BoxFuture, Middleware, Next};

/// Writes `{code, message, data}` once the inner chain returns.
///
/// Failures keep HTTP 200 unless something set a status explicitly; the
/// envelope code is the signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeMiddleware;

impl EnvelopeMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for EnvelopeMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            next.run(&mut *req).await;
            materialize(req, ResponsePolicy::Envelope);
        })
    }
}

/// Same envelope, but the status line follows the business code.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpNativeMiddleware;

impl HttpNativeMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for HttpNativeMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            next.run(&mut *req).await;
            materialize(req, ResponsePolicy::HttpNative);
        })
    }
}
