//! The route registry and the dispatch table built from it at start.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};

use crate::error::Error;
use crate::middleware::{BoxFuture, Invoke, Middleware, MiddlewareStack};
use crate::reflect::TypeInfo;
use crate::request::{PathParams, Request};

/// One bound endpoint.
pub struct RouteMeta {
    /// Uppercase HTTP verb.
    pub method: Method,
    /// Normalised path with `:name` parameters.
    pub path: String,
    pub group_prefix: Option<String>,
    pub summary: Option<String>,
    pub tag: Option<String>,
    pub description: Option<String>,
    pub req_type: TypeInfo,
    pub res_type: TypeInfo,
    /// `Controller.method`, used as the OpenAPI operation id.
    pub handler: String,
    pub invoker: Arc<dyn Invoke>,
    /// Group middleware followed by route middleware.
    pub middleware: MiddlewareStack,
}

impl std::fmt::Debug for RouteMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMeta")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("handler", &self.handler)
            .field("req_type", &self.req_type.name)
            .field("res_type", &self.res_type.name)
            .finish()
    }
}

/// Routes in registration order, unique by `(method, path)`.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: Vec<RouteMeta>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route. A route already registered under the same method and
    /// path is replaced in place.
    pub fn register(&mut self, route: RouteMeta) {
        match self
            .routes
            .iter_mut()
            .find(|r| r.method == route.method && r.path == route.path)
        {
            Some(existing) => {
                tracing::warn!(
                    method = %route.method,
                    path = %route.path,
                    replaced = %existing.handler,
                    by = %route.handler,
                    "duplicate route replaced"
                );
                *existing = route;
            }
            None => self.routes.push(route),
        }
    }

    pub fn get(&self, method: &Method, path: &str) -> Option<&RouteMeta> {
        self.routes
            .iter()
            .find(|r| r.method == *method && r.path == path)
    }

    pub fn routes(&self) -> &[RouteMeta] {
        &self.routes
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteMeta> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Leading slash, no repeated slashes, no trailing slash (except for `/`).
pub fn normalise(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// `/user/:id/*rest` to `/user/{id}/{*rest}`.
pub(crate) fn to_matchit(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{}}}", name)
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{}}}", name)
            } else {
                segment.replace('{', "{{").replace('}', "}}")
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Answers with a bare status; the response middleware turns it into an
/// envelope.
pub(crate) struct StatusEndpoint(pub StatusCode);

impl Invoke for StatusEndpoint {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move { req.response().set_status(self.0) })
    }
}

/// A dispatchable entry: its pattern, full middleware chain and endpoint.
pub(crate) struct Entry {
    pub pattern: String,
    pub chain: Vec<Arc<dyn Middleware>>,
    pub endpoint: Arc<dyn Invoke>,
}

pub(crate) enum Lookup<'a> {
    Found(&'a Entry, PathParams),
    MethodNotAllowed,
    NotFound,
}

/// Per-method `matchit` routers over the frozen routes.
#[derive(Default)]
pub(crate) struct RouteTable {
    routers: HashMap<Method, matchit::Router<usize>>,
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn insert(&mut self, method: Method, entry: Entry) -> Result<(), Error> {
        let index = self.entries.len();
        self.routers
            .entry(method.clone())
            .or_default()
            .insert(to_matchit(&entry.pattern), index)
            .map_err(|e| {
                Error::wrap(e, format!("registering route {} {}", method, entry.pattern))
            })?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Lookup<'_> {
        let found = self
            .routers
            .get(method)
            .and_then(|router| router.at(path).ok())
            .or_else(|| {
                // HEAD is served by GET routes unless registered explicitly
                (*method == Method::HEAD)
                    .then(|| self.routers.get(&Method::GET)?.at(path).ok())
                    .flatten()
            });

        if let Some(matched) = found {
            let params: PathParams = matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            return Lookup::Found(&self.entries[*matched.value], params);
        }

        let elsewhere = self
            .routers
            .iter()
            .any(|(other, router)| other != method && router.at(path).is_ok());
        if elsewhere {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
