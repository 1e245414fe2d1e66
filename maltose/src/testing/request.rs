//! In-memory request builder for middleware and binder tests.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method};
use serde::Serialize;

use crate::request::{PathParams, Request};
use crate::validate::{Locale, Validator};

/// Builds a [`Request`] without a server.
///
/// ```ignore
/// let req = TestRequest::post("/user/7")
///     .route("/user/:id", [("id", "7")])
///     .json(&serde_json::json!({"content": "new"}))
///     .build();
/// ```
pub struct TestRequest {
    builder: http::request::Builder,
    body: Bytes,
    route: Option<String>,
    params: PathParams,
    locale: Locale,
}

impl TestRequest {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            builder: http::Request::builder().method(method).uri(uri),
            body: Bytes::new(),
            route: None,
            params: PathParams::new(),
            locale: Locale::En,
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: &str) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn put(uri: &str) -> Self {
        Self::new(Method::PUT, uri)
    }

    pub fn delete(uri: &str) -> Self {
        Self::new(Method::DELETE, uri)
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(
            HeaderName::from_bytes(key.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    /// Marks the request as matched against `pattern` with the given params.
    pub fn route<'a>(
        mut self,
        pattern: &str,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.route = Some(pattern.to_string());
        self.params = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Self {
        self.body = Bytes::from(serde_json::to_vec(body).unwrap());
        self.header("content-type", "application/json")
    }

    pub fn form<T: Serialize>(mut self, body: &T) -> Self {
        self.body = Bytes::from(serde_urlencoded::to_string(body).unwrap());
        self.header("content-type", "application/x-www-form-urlencoded")
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Validation messages in `locale`.
    pub fn locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    pub fn build(self) -> Request {
        let (parts, ()) = self.builder.body(()).unwrap().into_parts();
        Request::new(parts, self.body, Arc::new(Validator::new(self.locale)))
            .with_route(self.route, self.params)
    }
}
