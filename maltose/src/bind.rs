//! Binding request data into typed requests.
//!
//! Values are gathered into a JSON object keyed by serde field names, in this
//! order: path parameters, then the query string (GET, DELETE and HEAD), then
//! the body (POST, PUT and PATCH; JSON, urlencoded form or multipart). A value
//! found by an earlier source is never overwritten by a later one. Fields with
//! no value get their zero value, the object is validated, and only then is it
//! deserialised into the request type.

use bytes::Bytes;
use http::{Method, StatusCode, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Code, Error};
use crate::reflect::{Reflect, Shape, StructShape};
use crate::request::Request;

const MAX_DEPTH: usize = 32;

/// Binds, validates and deserialises a request into `T`.
///
/// Binding failures are `INVALID_PARAMETER`, rule failures
/// `VALIDATION_FAILED`; both carry HTTP 400.
pub async fn bind<T>(req: &Request) -> Result<T, Error>
where
    T: Reflect + DeserializeOwned,
{
    let shape = T::shape();
    let value = match shape.as_struct() {
        Some(st) => {
            let value = Value::Object(collect(req, st).await?);
            req.validator().check(st, &value)?;
            value
        }
        None => body_json(req)?.unwrap_or(Value::Null),
    };

    serde_json::from_value(value).map_err(|e| {
        Error::wrap_code(Code::INVALID_PARAMETER, e, "invalid request")
            .with_status(StatusCode::BAD_REQUEST)
    })
}

async fn collect(req: &Request, st: &StructShape) -> Result<Map<String, Value>, Error> {
    let mut map = Map::new();

    for field in st.data_fields() {
        let Some(name) = field.uri_name() else {
            continue;
        };
        if let Some(raw) = req.param(&name) {
            let value = coerce(&name, raw.as_bytes(), &field.shape())?;
            map.insert(field.key.to_string(), value);
        }
    }

    let method = req.method();
    if matches!(*method, Method::GET | Method::DELETE | Method::HEAD) {
        if let Some(query) = req.query() {
            let pairs = parse_pairs(query.as_bytes())?;
            merge_pairs(&mut map, st, &pairs)?;
        }
    } else if matches!(*method, Method::POST | Method::PUT | Method::PATCH)
        && !req.body().is_empty()
    {
        merge_body(req, st, &mut map).await?;
    }

    fill_zero(&mut map, st, 0);
    Ok(map)
}

async fn merge_body(req: &Request, st: &StructShape, map: &mut Map<String, Value>) -> Result<(), Error> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/json" => merge_json(req, st, map),
        "application/x-www-form-urlencoded" => {
            let pairs = parse_pairs(req.body())?;
            merge_pairs(map, st, &pairs)
        }
        "multipart/form-data" => {
            let pairs = parse_multipart(content_type, req.body().clone()).await?;
            merge_pairs(map, st, &pairs)
        }
        // untyped bodies: JSON objects are recognised, everything else is a form
        "" if req.body().trim_ascii_start().starts_with(b"{") => merge_json(req, st, map),
        "" => {
            let pairs = parse_pairs(req.body())?;
            merge_pairs(map, st, &pairs)
        }
        other => Err(invalid(format!("unsupported content type: {}", other))),
    }
}

fn merge_json(req: &Request, st: &StructShape, map: &mut Map<String, Value>) -> Result<(), Error> {
    let Some(Value::Object(mut body)) = body_json(req)? else {
        return Err(invalid("request body must be a JSON object"));
    };
    for field in st.data_fields() {
        let Some(name) = field.json_name() else {
            continue;
        };
        if map.contains_key(field.key) {
            continue;
        }
        if let Some(value) = body.remove(&name) {
            map.insert(field.key.to_string(), remap(value, &field.shape(), 0));
        }
    }
    Ok(())
}

fn body_json(req: &Request) -> Result<Option<Value>, Error> {
    if req.body().is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(req.body())
        .map(Some)
        .map_err(|e| invalid(format!("malformed JSON body: {}", e)))
}

/// Renames nested JSON keys to serde keys.
fn remap(value: Value, shape: &Shape, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return value;
    }
    match (value, shape.unwrap_optional()) {
        (Value::Object(mut obj), Shape::Struct(st)) => {
            let mut out = Map::new();
            for field in st.data_fields() {
                if let Some(name) = field.json_name()
                    && let Some(v) = obj.remove(&name)
                {
                    out.insert(field.key.to_string(), remap(v, &field.shape(), depth + 1));
                }
            }
            Value::Object(out)
        }
        (Value::Array(items), Shape::Array(elem)) => Value::Array(
            items
                .into_iter()
                .map(|item| remap(item, elem, depth + 1))
                .collect(),
        ),
        (value, _) => value,
    }
}

fn parse_pairs(raw: &[u8]) -> Result<Vec<(String, Bytes)>, Error> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect())
        .map_err(|e| invalid(format!("malformed form data: {}", e)))
}

async fn parse_multipart(content_type: &str, body: Bytes) -> Result<Vec<(String, Bytes)>, Error> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| invalid(format!("malformed multipart: {}", e)))?;
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut pairs = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(format!("malformed multipart: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| invalid(format!("malformed multipart field {}: {}", name, e)))?;
        pairs.push((name, data));
    }
    Ok(pairs)
}

fn merge_pairs(map: &mut Map<String, Value>, st: &StructShape, pairs: &[(String, Bytes)]) -> Result<(), Error> {
    for field in st.data_fields() {
        let Some(name) = field.form_name() else {
            continue;
        };
        if map.contains_key(field.key) {
            continue;
        }
        let values: Vec<&Bytes> = pairs
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v)
            .collect();
        if values.is_empty() {
            continue;
        }

        let shape = field.shape();
        let value = match shape.unwrap_optional() {
            Shape::Array(elem) => Value::Array(
                values
                    .iter()
                    .map(|raw| coerce(&name, raw, elem))
                    .collect::<Result<_, _>>()?,
            ),
            _ => coerce(&name, values[0], &shape)?,
        };
        map.insert(field.key.to_string(), value);
    }
    Ok(())
}

/// Converts a textual value to JSON according to the target shape.
fn coerce(name: &str, raw: &[u8], shape: &Shape) -> Result<Value, Error> {
    if let Shape::Bytes = shape.unwrap_optional() {
        return Ok(Value::Array(raw.iter().map(|b| Value::from(*b)).collect()));
    }

    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let bad = || invalid(format!("invalid value for {}: {}", name, text));

    let value = match shape.unwrap_optional() {
        Shape::Integer { signed: true, .. } if text.is_empty() => Value::from(0),
        Shape::Integer { signed: true, .. } => Value::from(text.parse::<i64>().map_err(|_| bad())?),
        Shape::Integer { signed: false, .. } if text.is_empty() => Value::from(0),
        Shape::Integer { signed: false, .. } => Value::from(text.parse::<u64>().map_err(|_| bad())?),
        Shape::Number { .. } if text.is_empty() => Value::from(0.0),
        Shape::Number { .. } => {
            let n = text.parse::<f64>().map_err(|_| bad())?;
            serde_json::Number::from_f64(n).map(Value::Number).ok_or_else(bad)?
        }
        Shape::Boolean => Value::Bool(parse_bool(text).ok_or_else(bad)?),
        Shape::Array(elem) => Value::Array(vec![coerce(name, raw, elem)?]),
        Shape::Struct(_) | Shape::Map(_) => serde_json::from_str(text).map_err(|_| bad())?,
        _ => Value::String(String::from_utf8_lossy(raw).into_owned()),
    };
    Ok(value)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "" | "0" | "f" | "F" | "false" | "FALSE" | "False" | "off" => Some(false),
        "1" | "t" | "T" | "true" | "TRUE" | "True" | "on" => Some(true),
        _ => None,
    }
}

/// Inserts zero values for every field without one.
fn fill_zero(map: &mut Map<String, Value>, st: &StructShape, depth: usize) {
    for field in &st.fields {
        if field.skip {
            continue;
        }
        let shape = field.shape();
        match map.get_mut(field.key) {
            Some(Value::Object(nested)) => {
                if let Shape::Struct(inner) = shape.unwrap_optional()
                    && depth < MAX_DEPTH
                {
                    fill_zero(nested, inner, depth + 1);
                }
            }
            Some(_) => {}
            None => {
                map.insert(field.key.to_string(), zero(&shape, depth));
            }
        }
    }
}

/// The value a field takes when the request does not mention it.
pub fn zero(shape: &Shape, depth: usize) -> Value {
    match shape {
        Shape::String => Value::String(String::new()),
        Shape::Integer { .. } => Value::from(0),
        Shape::Number { .. } => Value::from(0.0),
        Shape::Boolean => Value::Bool(false),
        Shape::Array(_) | Shape::Bytes => Value::Array(Vec::new()),
        Shape::Map(_) => Value::Object(Map::new()),
        Shape::Struct(st) if depth < MAX_DEPTH => {
            let mut map = Map::new();
            fill_zero(&mut map, st, depth + 1);
            Value::Object(map)
        }
        Shape::Enum(variants) => variants
            .first()
            .map_or(Value::Null, |v| Value::String((*v).to_string())),
        Shape::Struct(_) | Shape::Optional(_) | Shape::Any | Shape::Marker => Value::Null,
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::invalid_parameter(message).with_status(StatusCode::BAD_REQUEST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRequest;
    use crate::{Meta, Reflect};
    use futures_util::FutureExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Reflect)]
    struct HelloReq {
        #[tag(path = "/hello", method = "get")]
        meta: Meta,
        #[tag(form = "name")]
        name: String,
        #[tag(form = "n")]
        count: u32,
        tags: Vec<String>,
        verbose: Option<bool>,
    }

    #[derive(Debug, Deserialize, Reflect)]
    struct UserReq {
        #[tag(path = "/user/:id", method = "post")]
        meta: Meta,
        #[tag(uri = "id")]
        id: i64,
        #[tag(json = "content")]
        content: String,
        profile: Profile,
    }

    #[derive(Debug, Default, Deserialize, Reflect)]
    #[serde(rename_all = "camelCase")]
    struct Profile {
        display_name: String,
        age: u8,
    }

    #[derive(Debug, Deserialize, Reflect)]
    struct SignupReq {
        #[tag(path = "/signup", method = "post")]
        meta: Meta,
        #[tag(binding = "required,email")]
        email: String,
    }

    fn run<T: Reflect + DeserializeOwned>(req: &Request) -> Result<T, Error> {
        bind::<T>(req).now_or_never().unwrap()
    }

    #[test]
    fn test_query_binding() {
        let req = TestRequest::get("/hello?name=Maltose&n=3&tags=a&tags=b").build();
        let bound: HelloReq = run(&req).unwrap();
        assert_eq!(bound.name, "Maltose");
        assert_eq!(bound.count, 3);
        assert_eq!(bound.tags, vec!["a", "b"]);
        assert_eq!(bound.verbose, None);
        let _ = bound.meta;
    }

    #[test]
    fn test_missing_fields_take_zero_values() {
        let req = TestRequest::get("/hello").build();
        let bound: HelloReq = run(&req).unwrap();
        assert_eq!(bound.name, "");
        assert_eq!(bound.count, 0);
        assert!(bound.tags.is_empty());
    }

    #[test]
    fn test_bad_number_is_invalid_parameter() {
        let req = TestRequest::get("/hello?n=many").build();
        let err = run::<HelloReq>(&req).unwrap_err();
        assert_eq!(err.code(), Code::INVALID_PARAMETER);
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_path_and_json_body() {
        let req = TestRequest::post("/user/123")
            .route("/user/:id", [("id", "123")])
            .json(&serde_json::json!({"content": "new", "id": 9, "profile": {"displayName": "Ann"}}))
            .build();
        let bound: UserReq = run(&req).unwrap();
        assert_eq!(bound.id, 123);
        assert_eq!(bound.content, "new");
        assert_eq!(bound.profile.display_name, "Ann");
        assert_eq!(bound.profile.age, 0);
    }

    #[test]
    fn test_form_body() {
        let req = TestRequest::post("/user/5")
            .route("/user/:id", [("id", "5")])
            .form(&[("content", "from form")])
            .build();
        let bound: UserReq = run(&req).unwrap();
        assert_eq!(bound.content, "from form");
    }

    #[test]
    fn test_multipart_body() {
        let body = "--XyZ\r\n\
                    Content-Disposition: form-data; name=\"content\"\r\n\r\n\
                    uploaded\r\n\
                    --XyZ--\r\n";
        let req = TestRequest::post("/user/1")
            .route("/user/:id", [("id", "1")])
            .header("content-type", "multipart/form-data; boundary=XyZ")
            .body(body)
            .build();
        let bound: UserReq = run(&req).unwrap();
        assert_eq!(bound.content, "uploaded");
    }

    #[test]
    fn test_unsupported_content_type() {
        let req = TestRequest::post("/user/1")
            .header("content-type", "application/xml")
            .body("<a/>")
            .build();
        let err = run::<UserReq>(&req).unwrap_err();
        assert_eq!(err.code(), Code::INVALID_PARAMETER);
    }

    #[test]
    fn test_validation_failure() {
        let req = TestRequest::post("/signup")
            .json(&serde_json::json!({"email": "bad"}))
            .build();
        let err = run::<SignupReq>(&req).unwrap_err();
        assert_eq!(err.code(), Code::VALIDATION_FAILED);
        assert_eq!(err.message(), "email must be a valid email address");
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_query_ignored_for_post() {
        let req = TestRequest::post("/signup?email=a@b.io").build();
        let err = run::<SignupReq>(&req).unwrap_err();
        assert_eq!(err.message(), "email is a required field");
    }

    #[test]
    fn test_coerce_bool_and_float() {
        assert_eq!(coerce("x", b"T", &Shape::Boolean).unwrap(), Value::Bool(true));
        assert_eq!(
            coerce("x", b"1.5", &Shape::Number { format: "double" }).unwrap(),
            serde_json::json!(1.5)
        );
        assert!(coerce("x", b"maybe", &Shape::Boolean).is_err());
    }
}
