//! Response writer, payloads and the `{code, message, data}` envelope.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::error::{Code, Error};
use crate::reflect::Reflect;
use crate::request::Request;

/// The body type used for HTTP responses.
pub type BoxBody = Full<Bytes>;

pub(crate) const JSON: &str = "application/json";
pub(crate) const TEXT: &str = "text/plain; charset=utf-8";
pub(crate) const OCTET: &str = "application/octet-stream";

/// A handler's return value, ready for serialisation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl Payload {
    pub fn encode<T: Reflect + Serialize>(value: &T) -> Result<Payload, Error> {
        if let Some(raw) = value.as_payload() {
            return Ok(raw);
        }
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| Error::wrap(e, "encoding response"))
    }
}

/// The uniform JSON response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: Code::OK.value(),
            message: Code::OK.message().to_string(),
            data: Some(data),
        }
    }

    pub fn failure(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code.value(),
            message: message.into(),
            data: None,
        }
    }
}

/// How errors reach the HTTP status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// Status defaults to 200; the envelope code carries the failure.
    #[default]
    Envelope,
    /// Status follows the business code unless set explicitly.
    HttpNative,
}

#[derive(Default)]
struct WriterState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

/// Per-request response state shared by the pipeline and the handler.
///
/// The body can be written once; later writes are dropped with a warning.
#[derive(Clone, Default)]
pub struct ResponseWriter {
    inner: Arc<Mutex<WriterState>>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WriterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The status that will be sent: explicit, or 200.
    pub fn status(&self) -> StatusCode {
        self.explicit_status().unwrap_or(StatusCode::OK)
    }

    pub fn explicit_status(&self) -> Option<StatusCode> {
        self.state().status
    }

    pub fn set_status(&self, status: StatusCode) {
        let mut state = self.state();
        if state.body.is_some() {
            tracing::warn!(%status, "status change after response was written ignored");
            return;
        }
        state.status = Some(status);
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.state().headers.insert(name, value);
    }

    pub fn headers(&self) -> HeaderMap {
        self.state().headers.clone()
    }

    /// Writes the body. Returns `false` when a body was already written.
    pub fn write(&self, status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> bool {
        let mut state = self.state();
        if state.body.is_some() {
            tracing::warn!(%status, "response already written, write ignored");
            return false;
        }
        if let Ok(value) = HeaderValue::from_str(content_type) {
            state.headers.insert(CONTENT_TYPE, value);
        }
        state.status = Some(status);
        state.body = Some(body.into());
        true
    }

    pub fn write_json<T: Serialize>(&self, status: StatusCode, value: &T) -> Result<bool, Error> {
        let body = serde_json::to_vec(value).map_err(|e| Error::wrap(e, "encoding response"))?;
        Ok(self.write(status, JSON, body))
    }

    pub fn is_written(&self) -> bool {
        self.state().body.is_some()
    }

    pub fn bytes_written(&self) -> usize {
        self.state().body.as_ref().map_or(0, Bytes::len)
    }

    pub(crate) fn to_response(&self) -> Response<BoxBody> {
        let state = self.state();
        let mut response = Response::new(Full::new(state.body.clone().unwrap_or_default()));
        *response.status_mut() = state.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = state.headers.clone();
        response
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ResponseWriter")
            .field("status", &state.status)
            .field("written", &state.body.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Produces the final body from the request's errors or payload.
///
/// Does nothing when something was already written.
pub fn materialize(req: &mut Request, policy: ResponsePolicy) {
    let writer = req.response().clone();
    if writer.is_written() {
        return;
    }

    if let Some(err) = req.error() {
        let code = err.code();
        let status = match policy {
            ResponsePolicy::Envelope => writer.status(),
            ResponsePolicy::HttpNative => writer.explicit_status().unwrap_or(code.http_status()),
        };
        write_envelope(&writer, status, &Envelope::<()>::failure(code, err.to_string()));
        return;
    }

    let status = writer.status();
    match req.take_payload() {
        Some(Payload::Text(text)) => {
            writer.write(status, TEXT, text);
        }
        Some(Payload::Binary(bytes)) => {
            writer.write(status, OCTET, bytes);
        }
        Some(Payload::Json(data)) => write_envelope(&writer, status, &Envelope::success(data)),
        None => {
            let code = Code::from_status(status);
            let message = status.canonical_reason().unwrap_or(code.message());
            write_envelope(&writer, status, &Envelope::<()>::failure(code, message));
        }
    }
}

fn write_envelope<T: Serialize>(writer: &ResponseWriter, status: StatusCode, envelope: &Envelope<T>) {
    if let Err(err) = writer.write_json(status, envelope) {
        tracing::error!(error = %err, "failed to encode response envelope");
        writer.write(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "internal error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRequest;

    fn body_json(writer: &ResponseWriter) -> serde_json::Value {
        let response = writer.to_response();
        let bytes = futures_util::FutureExt::now_or_never(http_body_util::BodyExt::collect(
            response.into_body(),
        ))
        .unwrap()
        .unwrap()
        .to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_write_once() {
        let writer = ResponseWriter::new();
        assert!(writer.write(StatusCode::CREATED, TEXT, "first"));
        assert!(!writer.write(StatusCode::OK, TEXT, "second"));
        assert_eq!(writer.status(), StatusCode::CREATED);
        assert_eq!(writer.bytes_written(), 5);
    }

    #[test]
    fn test_status_defaults_to_ok() {
        let writer = ResponseWriter::new();
        assert_eq!(writer.status(), StatusCode::OK);
        assert_eq!(writer.explicit_status(), None);
        writer.set_status(StatusCode::ACCEPTED);
        assert_eq!(writer.explicit_status(), Some(StatusCode::ACCEPTED));
    }

    #[test]
    fn test_envelope_success_shape() {
        let json = serde_json::to_value(Envelope::success(serde_json::json!({"id": 1}))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 0, "message": "OK", "data": {"id": 1}})
        );
    }

    #[test]
    fn test_envelope_failure_has_null_data() {
        let json = serde_json::to_value(Envelope::<()>::failure(Code::NOT_FOUND, "gone")).unwrap();
        assert_eq!(json["data"], serde_json::Value::Null);
        assert_eq!(json["code"], 404);
    }

    #[test]
    fn test_materialize_json_payload() {
        let mut req = TestRequest::get("/hello").build();
        req.set_payload(Payload::Json(serde_json::json!({"message": "hi"})));
        materialize(&mut req, ResponsePolicy::Envelope);

        let json = body_json(req.response());
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"]["message"], "hi");
    }

    #[test]
    fn test_materialize_error_keeps_status_200() {
        let mut req = TestRequest::get("/hello").build();
        req.push_error(Error::not_found("no such user"));
        materialize(&mut req, ResponsePolicy::Envelope);

        assert_eq!(req.response().status(), StatusCode::OK);
        let json = body_json(req.response());
        assert_eq!(json["code"], 404);
        assert_eq!(json["message"], "no such user");
    }

    #[test]
    fn test_materialize_http_native_status() {
        let mut req = TestRequest::get("/hello").build();
        req.push_error(Error::not_found("no such user"));
        materialize(&mut req, ResponsePolicy::HttpNative);
        assert_eq!(req.response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_materialize_text_payload() {
        let mut req = TestRequest::get("/hello").build();
        req.set_payload(Payload::Text("plain".to_string()));
        materialize(&mut req, ResponsePolicy::Envelope);

        let response = req.response().to_response();
        assert_eq!(response.headers()[CONTENT_TYPE], TEXT);
    }

    #[test]
    fn test_materialize_status_only() {
        let mut req = TestRequest::get("/missing").build();
        req.response().set_status(StatusCode::NOT_FOUND);
        materialize(&mut req, ResponsePolicy::Envelope);

        let json = body_json(req.response());
        assert_eq!(json["code"], 404);
        assert_eq!(json["message"], "Not Found");
    }

    #[test]
    fn test_materialize_skips_written_body() {
        let mut req = TestRequest::get("/raw").build();
        req.response().write(StatusCode::ACCEPTED, TEXT, "mine");
        req.push_error(Error::internal("ignored"));
        materialize(&mut req, ResponsePolicy::Envelope);

        assert_eq!(req.response().status(), StatusCode::ACCEPTED);
        assert_eq!(req.response().bytes_written(), 4);
    }

    #[test]
    fn test_payload_encode() {
        #[derive(Serialize)]
        struct Out {
            id: u32,
        }
        impl Reflect for Out {
            fn shape() -> crate::reflect::Shape {
                crate::reflect::Shape::Any
            }
        }

        assert_eq!(
            Payload::encode(&Out { id: 3 }).unwrap(),
            Payload::Json(serde_json::json!({"id": 3}))
        );
        assert_eq!(
            Payload::encode(&"text".to_string()).unwrap(),
            Payload::Text("text".to_string())
        );
    }
}
