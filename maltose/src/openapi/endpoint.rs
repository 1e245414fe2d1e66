//! Built-in endpoints: health, the OpenAPI document and Swagger UI.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::StatusCode;

use crate::middleware::{BoxFuture, Invoke};
use crate::registry::RouteRegistry;
use crate::request::Request;
use crate::response::JSON;

use super::build_openapi_spec;

/// Swagger UI page; `%s` is replaced with the OpenAPI document path.
pub const DEFAULT_SWAGGER_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>API Reference</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '%s', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>
"#;

const HTML: &str = "text/html; charset=utf-8";

/// `GET /health`, always `{"status":"ok"}`.
#[derive(Debug, Default)]
pub struct HealthEndpoint;

impl Invoke for HealthEndpoint {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            req.response()
                .write(StatusCode::OK, JSON, r#"{"status":"ok"}"#);
        })
    }
}

/// Serves the OpenAPI document, built on first request and reused after.
pub struct OpenApiEndpoint {
    title: String,
    registry: Arc<RouteRegistry>,
    document: OnceLock<Bytes>,
}

impl OpenApiEndpoint {
    pub fn new(title: impl Into<String>, registry: Arc<RouteRegistry>) -> Self {
        Self {
            title: title.into(),
            registry,
            document: OnceLock::new(),
        }
    }

    /// Serialised document.
    pub fn document(&self) -> &Bytes {
        self.document.get_or_init(|| {
            let spec = build_openapi_spec(&self.title, "1.0.0", &self.registry);
            match serde_json::to_vec(&spec) {
                Ok(json) => Bytes::from(json),
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode OpenAPI document");
                    Bytes::from_static(b"{}")
                }
            }
        })
    }
}

impl Invoke for OpenApiEndpoint {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            req.response()
                .write(StatusCode::OK, JSON, self.document().clone());
        })
    }
}

/// Swagger UI pointing at the OpenAPI path.
#[derive(Debug)]
pub struct SwaggerEndpoint {
    page: Bytes,
}

impl SwaggerEndpoint {
    pub fn new(template: &str, openapi_path: &str) -> Self {
        Self {
            page: Bytes::from(template.replace("%s", openapi_path)),
        }
    }
}

impl Invoke for SwaggerEndpoint {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            req.response().write(StatusCode::OK, HTML, self.page.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRequest;
    use futures_util::FutureExt;

    fn body(req: &Request) -> String {
        let response = req.response().to_response();
        let bytes = futures_util::FutureExt::now_or_never(http_body_util::BodyExt::collect(
            response.into_body(),
        ))
        .unwrap()
        .unwrap()
        .to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_health() {
        let mut req = TestRequest::get("/health").build();
        HealthEndpoint.invoke(&mut req).now_or_never().unwrap();
        assert_eq!(req.status(), StatusCode::OK);
        assert_eq!(body(&req), r#"{"status":"ok"}"#);
    }

    #[test]
    fn test_openapi_document_is_cached() {
        let endpoint = OpenApiEndpoint::new("svc", Arc::new(RouteRegistry::new()));
        let first = endpoint.document().clone();
        let second = endpoint.document().clone();
        assert_eq!(first.as_ptr(), second.as_ptr());

        let doc: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(doc["info"]["title"], "svc");
    }

    #[test]
    fn test_swagger_substitutes_path() {
        let endpoint = SwaggerEndpoint::new(DEFAULT_SWAGGER_TEMPLATE, "/api.json");
        let mut req = TestRequest::get("/swagger").build();
        endpoint.invoke(&mut req).now_or_never().unwrap();

        let page = body(&req);
        assert!(page.contains("url: '/api.json'"));
        assert!(!page.contains("%s"));
        assert_eq!(req.response().headers()[http::header::CONTENT_TYPE], HTML);
    }
}
