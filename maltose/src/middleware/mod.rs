mod envelope;
mod rate_limit;
mod recovery;
mod timeout;

pub use envelope::{EnvelopeMiddleware, HttpNativeMiddleware};
pub use rate_limit::{KeyExtractor, RateLimitConfig, RateLimitMiddleware};
pub use recovery::RecoveryMiddleware;
pub use timeout::TimeoutMiddleware;
pub(crate) use recovery::run_guarded;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A step of the request pipeline.
///
/// Code before `next.run(req).await` runs on the way in, code after it on the
/// way out. Not calling `next` aborts the chain; whatever the middleware left
/// in the request (errors, a status, a written body) becomes the response.
///
/// ```ignore
/// struct Timing;
///
/// impl Middleware for Timing {
///     fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
///         Box::pin(async move {
///             let start = std::time::Instant::now();
///             next.run(req).await;
///             tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "done");
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()>;
}

/// The end of a chain: a bound controller method or a built-in endpoint.
pub trait Invoke: Send + Sync + 'static {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()>;
}

/// The rest of the chain.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Invoke,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middlewares: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Invoke) -> Self {
        Self {
            middlewares,
            endpoint,
        }
    }

    pub async fn run(self, req: &mut Request) {
        if let Some((current, rest)) = self.middlewares.split_first() {
            let next = Next {
                middlewares: rest,
                endpoint: self.endpoint,
            };
            current.handle(req, next).await
        } else {
            self.endpoint.invoke(req).await
        }
    }
}

/// An ordered list of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Appends every middleware of `other`, keeping its order.
    pub fn extend(&mut self, other: &MiddlewareStack) {
        self.middlewares.extend(other.middlewares.iter().cloned());
    }

    pub(crate) fn to_vec(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.clone()
    }

    pub async fn execute(&self, req: &mut Request, endpoint: &dyn Invoke) {
        Next::new(&self.middlewares, endpoint).run(req).await
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("len", &self.middlewares.len())
            .finish()
    }
}

impl From<Vec<Arc<dyn Middleware>>> for MiddlewareStack {
    fn from(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRequest;
    use futures_util::FutureExt;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record {
        name: &'static str,
        log: Log,
        stop: bool,
    }

    impl Middleware for Record {
        fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{}.pre", self.name));
                if self.stop {
                    return;
                }
                next.run(req).await;
                self.log.lock().unwrap().push(format!("{}.post", self.name));
            })
        }
    }

    struct Handler(Log);

    impl Invoke for Handler {
        fn invoke<'a>(&'a self, _req: &'a mut Request) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.0.lock().unwrap().push("h".to_string());
            })
        }
    }

    fn stack(log: &Log, names: &[(&'static str, bool)]) -> MiddlewareStack {
        let mut stack = MiddlewareStack::new();
        for (name, stop) in names {
            stack.add(Record {
                name: *name,
                log: log.clone(),
                stop: *stop,
            });
        }
        stack
    }

    #[test]
    fn test_chain_order() {
        let log: Log = Arc::default();
        let stack = stack(&log, &[("m1", false), ("m2", false), ("m3", false)]);
        let mut req = TestRequest::get("/").build();

        stack
            .execute(&mut req, &Handler(log.clone()))
            .now_or_never()
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["m1.pre", "m2.pre", "m3.pre", "h", "m3.post", "m2.post", "m1.post"]
        );
    }

    #[test]
    fn test_abort_skips_rest() {
        let log: Log = Arc::default();
        let stack = stack(&log, &[("m1", false), ("m2", true), ("m3", false)]);
        let mut req = TestRequest::get("/").build();

        stack
            .execute(&mut req, &Handler(log.clone()))
            .now_or_never()
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["m1.pre", "m2.pre", "m1.post"]);
    }

    #[test]
    fn test_empty_stack_runs_endpoint() {
        let log: Log = Arc::default();
        let stack = MiddlewareStack::new();
        assert!(stack.is_empty());
        let mut req = TestRequest::get("/").build();

        stack
            .execute(&mut req, &Handler(log.clone()))
            .now_or_never()
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["h"]);
    }

    #[test]
    fn test_extend_keeps_order() {
        let log: Log = Arc::default();
        let mut outer = stack(&log, &[("server", false)]);
        outer.extend(&stack(&log, &[("group", false), ("route", false)]));
        assert_eq!(outer.len(), 3);
        let mut req = TestRequest::get("/").build();

        outer
            .execute(&mut req, &Handler(log.clone()))
            .now_or_never()
            .unwrap();

        assert_eq!(
            log.lock().unwrap()[..4],
            ["server.pre", "group.pre", "route.pre", "h"]
        );
    }
}
