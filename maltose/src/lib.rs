//! Declarative HTTP APIs: request types carry their route, controllers carry
//! the handlers, and the server derives routing, binding, validation,
//! envelopes, OpenAPI, tracing and metrics from them.

// lets the derive output's `maltose::` paths resolve inside this crate
extern crate self as maltose;

pub mod bind;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod meta;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod openapi;
pub mod reflect;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod testing;
pub mod validate;

pub use maltose_macros::{Reflect, controller};
pub use meta::Meta;
pub use reflect::Reflect;

pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::context::RequestContext;
    pub use crate::controller::{Controller, Group};
    pub use crate::error::{Code, Error, IntoError, Result};
    pub use crate::meta::Meta;
    pub use crate::metrics::MetricManager;
    pub use crate::middleware::{
        BoxFuture, Middleware, MiddlewareStack, Next, RateLimitConfig, RateLimitMiddleware,
    };
    pub use crate::observability::TracingConfig;
    pub use crate::reflect::Reflect;
    pub use crate::request::Request;
    pub use crate::response::ResponsePolicy;
    pub use crate::server::Server;
    pub use crate::validate::Locale;

    pub use http::{Method, StatusCode};
    pub use serde::{Deserialize, Serialize};

    pub use maltose_macros::{Reflect, controller};
}
