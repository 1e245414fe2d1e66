//! Per-request state carried through the middleware chain.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{Extensions, HeaderMap, Method, StatusCode, Uri, Version};
use smallvec::SmallVec;

use crate::context::RequestContext;
use crate::error::Error;
use crate::response::{Payload, ResponsePolicy, ResponseWriter};
use crate::validate::Validator;

/// Path parameters in match order.
pub type PathParams = SmallVec<[(String, String); 4]>;

/// The request envelope: parsed input, handler output, accumulated errors and
/// the shared response writer.
///
/// Middleware receive `&mut Request`; the handler sees the
/// [`RequestContext`] view of it.
pub struct Request {
    parts: Parts,
    body: Bytes,
    params: PathParams,
    ctx: RequestContext,
    errors: Vec<Error>,
    payload: Option<Payload>,
    validator: Arc<Validator>,
    local_addr: Option<SocketAddr>,
    tls: bool,
    policy: ResponsePolicy,
}

impl Request {
    pub(crate) fn new(parts: Parts, body: Bytes, validator: Arc<Validator>) -> Self {
        let ctx = RequestContext::from_parts(&parts, None);
        Self {
            parts,
            body,
            params: PathParams::new(),
            ctx,
            errors: Vec::new(),
            payload: None,
            validator,
            local_addr: None,
            tls: false,
            policy: ResponsePolicy::default(),
        }
    }

    pub(crate) fn with_route(mut self, pattern: Option<String>, params: PathParams) -> Self {
        self.ctx.set_route(pattern);
        self.params = params;
        self
    }

    pub(crate) fn with_connection(
        mut self,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        tls: bool,
    ) -> Self {
        self.ctx.set_remote_addr(remote_addr);
        self.local_addr = local_addr;
        self.tls = tls;
        self
    }

    pub(crate) fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn extensions(&self) -> &Extensions {
        &self.parts.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.parts.extensions
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The matched route pattern.
    pub fn route(&self) -> Option<&str> {
        self.ctx.route()
    }

    /// `https` for TLS connections, `http` otherwise.
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.ctx.remote_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `Host` header, falling back to the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.parts.uri.host())
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.ctx
    }

    pub fn trace_id(&self) -> &str {
        &self.ctx.trace_id
    }

    pub fn response(&self) -> &ResponseWriter {
        self.ctx.response()
    }

    /// How errors reach the status line for this request.
    pub fn policy(&self) -> ResponsePolicy {
        self.policy
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Records an error. The first one decides the envelope code; an explicit
    /// status on the error applies unless a status was already set.
    pub fn push_error(&mut self, err: Error) {
        if let Some(status) = err.status()
            && self.response().explicit_status().is_none()
        {
            self.response().set_status(status);
        }
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The primary error.
    pub fn error(&self) -> Option<&Error> {
        self.errors.first()
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(payload);
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// Status as it stands: explicit, or 200.
    pub fn status(&self) -> StatusCode {
        self.response().status()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("route", &self.ctx.route())
            .field("errors", &self.errors.len())
            .finish()
    }
}
