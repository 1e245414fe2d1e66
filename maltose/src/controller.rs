//! Controllers, their endpoints and route groups.
//!
//! A controller is a plain struct whose `impl` block carries `#[controller]`.
//! Every `async fn name(&self, ctx: &RequestContext, req: Req) -> Result<Res, E>`
//! in that block becomes an endpoint; the route comes from the marker tag of
//! `Req`:
//!
//! ```ignore
//! #[derive(Deserialize, Reflect)]
//! struct HelloReq {
//!     #[tag(path = "/hello", method = "get")]
//!     meta: Meta,
//!     #[tag(form = "name")]
//!     name: String,
//! }
//!
//! struct Hello;
//!
//! #[controller]
//! impl Hello {
//!     async fn say(&self, _ctx: &RequestContext, req: HelloReq) -> Result<HelloRes> {
//!         Ok(HelloRes { message: format!("Hello, {}", req.name) })
//!     }
//! }
//! ```
//!
//! Methods with any other shape are reported as rejected and skipped with a
//! warning.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bind::bind;
use crate::context::RequestContext;
use crate::error::Error;
use crate::meta;
use crate::middleware::{BoxFuture, Invoke, Middleware, MiddlewareStack};
use crate::reflect::{Reflect, TypeInfo, short_type_name};
use crate::registry::{RouteMeta, normalise};
use crate::request::Request;
use crate::response::Payload;

/// Implemented by `#[controller]`.
pub trait Controller: Send + Sync + Sized + 'static {
    /// Every method of the annotated `impl` block that takes `&self`.
    fn endpoints() -> Vec<Endpoint<Self>>;
}

type MakeInvoker<C> = Arc<dyn Fn(Arc<C>) -> Arc<dyn Invoke> + Send + Sync>;

/// One method of a controller, as seen by the introspector.
pub struct Endpoint<C> {
    name: &'static str,
    kind: Kind<C>,
}

enum Kind<C> {
    Bindable {
        req: TypeInfo,
        res: TypeInfo,
        make: MakeInvoker<C>,
    },
    Rejected(&'static str),
}

impl<C: Send + Sync + 'static> Endpoint<C> {
    /// A method with the endpoint shape. `handler` forwards to it.
    pub fn bindable<Req, Res, F, Fut>(name: &'static str, handler: F) -> Self
    where
        Req: Reflect + DeserializeOwned + Send + 'static,
        Res: Reflect + Serialize + Send + 'static,
        F: Fn(Arc<C>, RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Error>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let make: MakeInvoker<C> = Arc::new(move |controller: Arc<C>| {
            Arc::new(Invoker {
                controller,
                handler: Arc::clone(&handler),
                _types: PhantomData::<fn(Req) -> Res>,
            }) as Arc<dyn Invoke>
        });
        Self {
            name,
            kind: Kind::Bindable {
                req: TypeInfo::of::<Req>(),
                res: TypeInfo::of::<Res>(),
                make,
            },
        }
    }

    /// A method that cannot be bound, with the reason.
    pub fn rejected(name: &'static str, reason: &'static str) -> Self {
        Self {
            name,
            kind: Kind::Rejected(reason),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_bindable(&self) -> bool {
        matches!(self.kind, Kind::Bindable { .. })
    }

    /// Why the method was rejected.
    pub fn rejection(&self) -> Option<&'static str> {
        match self.kind {
            Kind::Rejected(reason) => Some(reason),
            Kind::Bindable { .. } => None,
        }
    }

    /// Request type of a bindable method.
    pub fn req_type(&self) -> Option<TypeInfo> {
        match &self.kind {
            Kind::Bindable { req, .. } => Some(*req),
            Kind::Rejected(_) => None,
        }
    }
}

struct Invoker<C, F, Req, Res> {
    controller: Arc<C>,
    handler: Arc<F>,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<C, F, Fut, Req, Res> Invoke for Invoker<C, F, Req, Res>
where
    C: Send + Sync + 'static,
    Req: Reflect + DeserializeOwned + Send + 'static,
    Res: Reflect + Serialize + Send + 'static,
    F: Fn(Arc<C>, RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, Error>> + Send + 'static,
{
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let input = match bind::<Req>(req).await {
                Ok(input) => input,
                Err(err) => {
                    tracing::debug!(error = %err, "request binding failed");
                    req.push_error(err);
                    return;
                }
            };

            let ctx = req.context().clone();
            match (self.handler)(Arc::clone(&self.controller), ctx, input).await {
                Ok(res) if res.is_null() => {}
                Ok(res) => match Payload::encode(&res) {
                    Ok(payload) => req.set_payload(payload),
                    Err(err) => req.push_error(err),
                },
                Err(err) => req.push_error(err),
            }
        })
    }
}

/// Turns a controller into routes under `prefix`.
///
/// `middleware` is the group chain followed by the route chain.
pub(crate) fn introspect<C: Controller>(
    controller: Arc<C>,
    prefix: &str,
    middleware: &MiddlewareStack,
) -> Vec<RouteMeta> {
    let controller_name = short_type_name(std::any::type_name::<C>());
    let mut routes = Vec::new();

    for endpoint in C::endpoints() {
        let (req, res, make) = match endpoint.kind {
            Kind::Bindable { req, res, make } => (req, res, make),
            Kind::Rejected(reason) => {
                tracing::warn!(
                    controller = controller_name,
                    method = endpoint.name,
                    reason,
                    "method skipped"
                );
                continue;
            }
        };

        let tags = meta::read(&req.shape());
        let (Some(path), Some(verb)) = (tags.get("path"), tags.get("method")) else {
            tracing::warn!(
                controller = controller_name,
                method = endpoint.name,
                req = req.short_name(),
                "method skipped: request marker needs both path and method"
            );
            continue;
        };
        let Ok(method) = Method::from_bytes(verb.trim().to_ascii_uppercase().as_bytes()) else {
            tracing::warn!(
                controller = controller_name,
                method = endpoint.name,
                verb = %verb,
                "method skipped: invalid HTTP method"
            );
            continue;
        };

        // the marker's own group replaces the enclosing prefix
        let group_prefix = tags
            .get("group")
            .map(String::as_str)
            .unwrap_or(prefix)
            .to_string();
        let full_path = normalise(&format!("{}/{}", group_prefix, path));
        let group_prefix = normalise(&group_prefix);
        let text = |key: &str| tags.get(key).filter(|v| !v.is_empty()).cloned();

        routes.push(RouteMeta {
            method,
            path: full_path,
            group_prefix: (group_prefix != "/").then_some(group_prefix),
            summary: text("summary"),
            tag: text("tag"),
            description: text("dc"),
            req_type: req,
            res_type: res,
            handler: format!("{}.{}", controller_name, endpoint.name),
            invoker: make(Arc::clone(&controller)),
            middleware: middleware.clone(),
        });
    }

    routes
}

/// A set of routes sharing a path prefix and middleware.
///
/// Middleware added to a group applies to controllers bound after it.
///
/// ```ignore
/// Server::new(config).group("/api", |g| {
///     g.middleware(Auth)
///         .bind(Users)
///         .group("/v2", |v2| v2.bind(Orders))
/// })
/// ```
pub struct Group {
    prefix: String,
    middleware: MiddlewareStack,
    routes: Vec<RouteMeta>,
}

impl Group {
    pub(crate) fn new(prefix: &str, middleware: MiddlewareStack) -> Self {
        Self {
            prefix: normalise(prefix),
            middleware,
            routes: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.add(middleware);
        self
    }

    pub fn bind<C: Controller>(self, controller: C) -> Self {
        self.bind_with(controller, MiddlewareStack::new())
    }

    /// Binds with extra middleware that runs only for this controller's routes.
    pub fn bind_with<C: Controller>(
        mut self,
        controller: C,
        middleware: impl Into<MiddlewareStack>,
    ) -> Self {
        let mut chain = self.middleware.clone();
        chain.extend(&middleware.into());
        let routes = introspect(Arc::new(controller), &self.prefix, &chain);
        self.routes.extend(routes);
        self
    }

    /// A nested group; prefixes and middleware accumulate.
    pub fn group(mut self, prefix: &str, f: impl FnOnce(Group) -> Group) -> Self {
        let child = f(Group::new(
            &format!("{}/{}", self.prefix, prefix),
            self.middleware.clone(),
        ));
        self.routes.extend(child.routes);
        self
    }

    pub(crate) fn into_routes(self) -> Vec<RouteMeta> {
        self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Next;
    use crate::{Meta, Reflect};
    use serde::Deserialize;

    #[derive(Deserialize, Reflect)]
    struct ListReq {
        #[tag(path = "/items", method = "get", summary = "List items", tag = "Items")]
        meta: Meta,
    }

    #[derive(Deserialize, Reflect)]
    struct AdminReq {
        #[tag(path = "stats", method = "Get", group = "/admin")]
        meta: Meta,
    }

    #[derive(Deserialize, Reflect)]
    struct NoMethodReq {
        #[tag(path = "/lost")]
        meta: Meta,
    }

    #[derive(Serialize, Reflect)]
    struct Items {
        count: u32,
    }

    struct Shop;

    impl Controller for Shop {
        fn endpoints() -> Vec<Endpoint<Self>> {
            vec![
                Endpoint::bindable("list", |_: Arc<Shop>, _: RequestContext, _: ListReq| async {
                    Ok::<_, Error>(Items { count: 2 })
                }),
                Endpoint::bindable("stats", |_: Arc<Shop>, _: RequestContext, _: AdminReq| async {
                    Ok::<_, Error>(Items { count: 0 })
                }),
                Endpoint::bindable("lost", |_: Arc<Shop>, _: RequestContext, _: NoMethodReq| async {
                    Ok::<_, Error>(Items { count: 0 })
                }),
                Endpoint::rejected("helper", "expected exactly two parameters"),
            ]
        }
    }

    struct Noop;

    impl Middleware for Noop {
        fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
            Box::pin(next.run(req))
        }
    }

    #[test]
    fn test_introspect_accepts_marked_methods() {
        let routes = introspect(Arc::new(Shop), "", &MiddlewareStack::new());
        let keys: Vec<(String, String)> = routes
            .iter()
            .map(|r| (r.method.to_string(), r.path.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("GET".to_string(), "/items".to_string()),
                ("GET".to_string(), "/admin/stats".to_string()),
            ]
        );
        assert_eq!(routes[0].summary.as_deref(), Some("List items"));
        assert_eq!(routes[0].tag.as_deref(), Some("Items"));
        assert_eq!(routes[0].handler, "Shop.list");
        assert_eq!(routes[0].res_type.short_name(), "Items");
    }

    #[test]
    fn test_group_prefix_and_override() {
        let routes = Group::new("/api/", MiddlewareStack::new())
            .group("v1", |g| g.bind(Shop))
            .into_routes();
        assert_eq!(routes[0].path, "/api/v1/items");
        assert_eq!(routes[0].group_prefix.as_deref(), Some("/api/v1"));
        assert_eq!(routes[1].path, "/admin/stats");
    }

    #[test]
    fn test_group_middleware_is_captured_at_bind() {
        let routes = Group::new("/g", MiddlewareStack::new())
            .bind(Shop)
            .middleware(Noop)
            .bind_with(Shop, vec![Arc::new(Noop) as Arc<dyn Middleware>])
            .into_routes();
        assert_eq!(routes[0].middleware.len(), 0);
        assert_eq!(routes[2].middleware.len(), 2);
    }

    #[test]
    fn test_endpoint_accessors() {
        let endpoints = Shop::endpoints();
        assert!(endpoints[0].is_bindable());
        assert_eq!(endpoints[0].name(), "list");
        assert_eq!(
            endpoints[0].req_type().map(|t| t.short_name()),
            Some("ListReq")
        );
        assert_eq!(
            endpoints[3].rejection(),
            Some("expected exactly two parameters")
        );
    }
}
