//! OpenAPI 3.0 document structures and the builder over the route registry.

use std::collections::BTreeMap;

use http::Method;
use schemars::{Schema, json_schema};
use serde::Serialize;

use crate::reflect::{Field, Shape};
use crate::registry::{RouteMeta, RouteRegistry};
use crate::response::{JSON, OCTET};

use super::schema::{response_schema_for, schema_for, struct_schema};

const TEXT_PLAIN: &str = "text/plain";

#[derive(Debug, Clone, Serialize)]
pub struct OpenApiSpec {
    pub openapi: String,
    pub info: Info,
    pub paths: BTreeMap<String, PathItem>,
}

impl OpenApiSpec {
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            openapi: "3.0.0".to_string(),
            info: Info {
                title: title.into(),
                version: version.into(),
                description: None,
            },
            paths: BTreeMap::new(),
        }
    }
}

/// API metadata
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub title: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Operations available on a single path
#[derive(Debug, Clone, Serialize, Default)]
pub struct PathItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub put: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Operation>,
}

impl PathItem {
    /// Slot for a verb, `None` for verbs OpenAPI has no key for.
    pub fn slot(&mut self, method: &Method) -> Option<&mut Option<Operation>> {
        match *method {
            Method::GET => Some(&mut self.get),
            Method::POST => Some(&mut self.post),
            Method::PUT => Some(&mut self.put),
            Method::PATCH => Some(&mut self.patch),
            Method::DELETE => Some(&mut self.delete),
            Method::HEAD => Some(&mut self.head),
            Method::OPTIONS => Some(&mut self.options),
            _ => None,
        }
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        [
            &self.get,
            &self.post,
            &self.put,
            &self.patch,
            &self.delete,
            &self.head,
            &self.options,
        ]
        .into_iter()
        .flatten()
    }
}

/// A single API operation (endpoint)
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(rename = "requestBody", skip_serializing_if = "Option::is_none")]
    pub request_body: Option<RequestBody>,
    pub responses: BTreeMap<String, Response>,
}

impl Default for Operation {
    fn default() -> Self {
        let mut responses = BTreeMap::new();
        responses.insert(
            "200".to_string(),
            Response {
                description: "Success".to_string(),
                content: None,
            },
        );
        Self {
            tags: Vec::new(),
            summary: None,
            description: None,
            operation_id: None,
            parameters: Vec::new(),
            request_body: None,
            responses,
        }
    }
}

/// Path, Query, or header parameter
#[derive(Debug, Clone, Serialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
}

/// Request body definition
#[derive(Debug, Clone, Serialize)]
pub struct RequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    pub content: BTreeMap<String, MediaType>,
}

/// Response definition
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<BTreeMap<String, MediaType>>,
}

/// MediaType with schema
#[derive(Debug, Clone, Serialize)]
pub struct MediaType {
    pub schema: Schema,
}

fn media(content_type: &str, schema: Schema) -> BTreeMap<String, MediaType> {
    BTreeMap::from([(content_type.to_string(), MediaType { schema })])
}

/// Builds the document for every registered route.
pub fn build_openapi_spec(
    title: &str,
    version: &str,
    registry: &RouteRegistry,
) -> OpenApiSpec {
    let mut spec = OpenApiSpec::new(title, version);

    for route in registry.iter() {
        let path_item = spec.paths.entry(openapi_path(&route.path)).or_default();
        match path_item.slot(&route.method) {
            Some(slot) => *slot = Some(operation(route)),
            None => tracing::debug!(
                method = %route.method,
                path = %route.path,
                "verb has no OpenAPI operation key"
            ),
        }
    }

    spec
}

/// `/user/:id` to `/user/{id}`.
fn openapi_path(path: &str) -> String {
    path.split('/')
        .map(|s| match s.strip_prefix(':').or_else(|| s.strip_prefix('*')) {
            Some(name) => format!("{{{}}}", name),
            None => s.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn has_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::DELETE | Method::HEAD)
}

fn operation(route: &RouteMeta) -> Operation {
    let req_shape = route.req_type.shape();
    let req = req_shape.as_struct();
    let fields: Vec<&Field> = req.map(|s| s.data_fields().collect()).unwrap_or_default();

    let mut parameters: Vec<Parameter> = route
        .path
        .split('/')
        .filter_map(|s| s.strip_prefix(':').or_else(|| s.strip_prefix('*')))
        .map(|name| {
            let field = fields
                .iter()
                .find(|f| f.uri_name().as_deref() == Some(name));
            Parameter {
                name: name.to_string(),
                location: ParameterLocation::Path,
                description: field.and_then(|f| f.description()),
                required: true,
                schema: Some(
                    field
                        .map(|f| schema_for(f.shape().unwrap_optional()))
                        .unwrap_or_else(|| json_schema!({ "type": "string" })),
                ),
            }
        })
        .collect();

    let mut request_body = None;
    if has_body(&route.method) {
        request_body = req.map(|s| RequestBody {
            description: None,
            required: true,
            content: media(JSON, struct_schema(s, Field::is_path_only)),
        });
    } else {
        parameters.extend(
            fields
                .iter()
                .filter(|f| !f.is_path_only())
                .filter_map(|f| {
                    Some(Parameter {
                        name: f.form_name()?,
                        location: ParameterLocation::Query,
                        description: f.description(),
                        required: f.is_required(),
                        schema: Some(schema_for(f.shape().unwrap_optional())),
                    })
                }),
        );
    }

    let mut op = Operation {
        tags: route.tag.iter().cloned().collect(),
        summary: route.summary.clone(),
        description: route.description.clone(),
        operation_id: Some(route.handler.clone()),
        parameters,
        request_body,
        ..Default::default()
    };
    op.responses.insert(
        "200".to_string(),
        Response {
            description: "Success".to_string(),
            content: Some(response_content(&route.res_type.shape())),
        },
    );
    op
}

/// JSON results are documented inside the envelope.
fn response_content(shape: &Shape) -> BTreeMap<String, MediaType> {
    match shape.unwrap_optional() {
        Shape::String => media(TEXT_PLAIN, json_schema!({ "type": "string" })),
        Shape::Bytes => media(OCTET, json_schema!({ "type": "string", "format": "binary" })),
        data => {
            let data = response_schema_for(data);
            let envelope = json_schema!({
                "type": "object",
                "properties": {
                    "code": { "type": "integer", "format": "int32" },
                    "message": { "type": "string" },
                    "data": data,
                },
                "required": ["code", "message"],
            });
            media(JSON, envelope)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareStack;
    use crate::reflect::TypeInfo;
    use crate::registry::StatusEndpoint;
    use crate::{Meta, Reflect};
    use http::StatusCode;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Deserialize, Reflect)]
    #[allow(dead_code)]
    struct DocReq {
        #[tag(path = "/doc/test", method = "post", summary = "Test endpoint", tag = "Documentation")]
        meta: Meta,
        #[tag(json = "id", binding = "required", dc = "The unique identifier")]
        id: i64,
    }

    #[derive(Deserialize, Reflect)]
    #[allow(dead_code)]
    struct ListReq {
        #[tag(path = "/team/:team/users", method = "get")]
        meta: Meta,
        #[tag(uri = "team", dc = "Team id")]
        team: u32,
        #[tag(form = "page_size", json = "size", binding = "required")]
        size: u32,
        #[tag(json = "q")]
        query: Option<String>,
        #[tag(json = "-")]
        hidden: String,
    }

    #[derive(Reflect)]
    #[allow(dead_code)]
    struct Item {
        id: i64,
    }

    fn route<Req: Reflect + 'static, Res: Reflect + 'static>(
        method: Method,
        path: &str,
        tag: Option<&str>,
    ) -> RouteMeta {
        RouteMeta {
            method,
            path: path.to_string(),
            group_prefix: None,
            summary: Some("Test endpoint".to_string()),
            tag: tag.map(str::to_string),
            description: None,
            req_type: TypeInfo::of::<Req>(),
            res_type: TypeInfo::of::<Res>(),
            handler: "Doc.test".to_string(),
            invoker: Arc::new(StatusEndpoint(StatusCode::OK)),
            middleware: MiddlewareStack::new(),
        }
    }

    fn document(registry: &RouteRegistry) -> serde_json::Value {
        serde_json::to_value(build_openapi_spec("maltose", "1.0.0", registry)).unwrap()
    }

    #[test]
    fn test_document_header() {
        let doc = document(&RouteRegistry::new());
        assert_eq!(doc["openapi"], "3.0.0");
        assert_eq!(doc["info"]["title"], "maltose");
        assert_eq!(doc["info"]["version"], "1.0.0");
    }

    #[test]
    fn test_post_request_body() {
        let mut registry = RouteRegistry::new();
        registry.register(route::<DocReq, Item>(
            Method::POST,
            "/doc/test",
            Some("Documentation"),
        ));
        let doc = document(&registry);
        let op = &doc["paths"]["/doc/test"]["post"];

        assert_eq!(op["summary"], "Test endpoint");
        assert_eq!(op["tags"], serde_json::json!(["Documentation"]));
        assert_eq!(op["operationId"], "Doc.test");
        let schema = &op["requestBody"]["content"]["application/json"]["schema"];
        assert_eq!(schema["properties"]["id"]["type"], "integer");
        assert_eq!(
            schema["properties"]["id"]["description"],
            "The unique identifier"
        );
        assert_eq!(schema["required"], serde_json::json!(["id"]));
        assert!(op.get("parameters").is_none());
    }

    #[test]
    fn test_get_query_and_path_parameters() {
        let mut registry = RouteRegistry::new();
        registry.register(route::<ListReq, Vec<Item>>(
            Method::GET,
            "/team/:team/users",
            None,
        ));
        let doc = document(&registry);
        let op = &doc["paths"]["/team/{team}/users"]["get"];

        assert!(op.get("requestBody").is_none());
        assert!(op.get("tags").is_none());
        let params = op["parameters"].as_array().unwrap();
        let names: Vec<_> = params.iter().map(|p| p["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["team", "page_size", "q"]);

        assert_eq!(params[0]["in"], "path");
        assert_eq!(params[0]["required"], true);
        assert_eq!(params[0]["description"], "Team id");
        assert_eq!(params[0]["schema"]["type"], "integer");
        assert_eq!(params[1]["in"], "query");
        assert_eq!(params[1]["required"], true);
        assert_eq!(params[2]["required"], false);
        assert_eq!(params[2]["schema"]["type"], "string");
    }

    #[test]
    fn test_response_is_enveloped() {
        let mut registry = RouteRegistry::new();
        registry.register(route::<ListReq, Vec<Item>>(
            Method::GET,
            "/team/:team/users",
            None,
        ));
        let doc = document(&registry);
        let schema = &doc["paths"]["/team/{team}/users"]["get"]["responses"]["200"]["content"]
            ["application/json"]["schema"];

        assert_eq!(schema["properties"]["code"]["type"], "integer");
        assert_eq!(schema["properties"]["data"]["type"], "array");
        assert_eq!(
            schema["properties"]["data"]["items"]["properties"]["id"]["type"],
            "integer"
        );
    }

    #[test]
    fn test_text_and_binary_responses() {
        let mut registry = RouteRegistry::new();
        registry.register(route::<DocReq, String>(Method::POST, "/text", None));
        registry.register(route::<DocReq, bytes::Bytes>(Method::POST, "/bin", None));
        let doc = document(&registry);

        let text = &doc["paths"]["/text"]["post"]["responses"]["200"]["content"];
        assert_eq!(text["text/plain"]["schema"]["type"], "string");
        let bin = &doc["paths"]["/bin"]["post"]["responses"]["200"]["content"];
        assert_eq!(bin["application/octet-stream"]["schema"]["format"], "binary");
    }

    #[test]
    fn test_one_operation_per_route() {
        let mut registry = RouteRegistry::new();
        registry.register(route::<DocReq, Item>(Method::POST, "/a", None));
        registry.register(route::<DocReq, Item>(Method::PUT, "/a", None));
        registry.register(route::<ListReq, Item>(Method::GET, "/b", None));
        let spec = build_openapi_spec("t", "1", &registry);

        let count: usize = spec.paths.values().map(|p| p.operations().count()).sum();
        assert_eq!(count, registry.len());
    }
}
