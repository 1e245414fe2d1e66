//! The HTTP server: builder, dispatch and lifecycle.
//!
//! ```ignore
//! use maltose::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> maltose::error::Result<()> {
//!     TracingConfig::from_env()?.try_init()?;
//!     Server::new(ServerConfig::from_env()?)
//!         .middleware(RateLimitMiddleware::new(RateLimitConfig::per_minute(600)))
//!         .bind(Hello)
//!         .group("/api", |api| api.bind(Users))
//!         .run()
//!         .await
//! }
//! ```

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tracing::Instrument;

use crate::config::{ServerConfig, TlsConfig};
use crate::controller::{Controller, Group};
use crate::error::{Code, Error};
use crate::metrics::{MetricManager, MetricsEndpoint, MetricsMiddleware};
use crate::middleware::{
    BoxFuture, EnvelopeMiddleware, HttpNativeMiddleware, Invoke, Middleware, MiddlewareStack,
    Next, RecoveryMiddleware, TimeoutMiddleware,
};
use crate::observability::TracingMiddleware;
use crate::openapi::{HealthEndpoint, OpenApiEndpoint, SwaggerEndpoint};
use crate::registry::{Entry, Lookup, RouteRegistry, RouteTable, StatusEndpoint, normalise};
use crate::request::{PathParams, Request};
use crate::response::{BoxBody, ResponsePolicy};
use crate::validate::Validator;

/// hyper refuses smaller read buffers.
const MIN_BUF_SIZE: usize = 8192;

/// Pause after an accept error that is not about a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), Error>>,
}

/// Routes, middleware and settings, then a running listener.
///
/// Builder methods consume the server; [`start`](Server::start) or
/// [`serve`](Server::serve) freeze the route registry.
pub struct Server {
    config: ServerConfig,
    middleware: MiddlewareStack,
    registry: Arc<RouteRegistry>,
    metrics: Option<MetricManager>,
    policy: ResponsePolicy,
    frozen: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("routes", &self.registry.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            middleware: MiddlewareStack::new(),
            registry: Arc::new(RouteRegistry::new()),
            metrics: None,
            policy: ResponsePolicy::default(),
            frozen: false,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Routes bound so far.
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Adds middleware that runs for every route, built-ins included.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.add(middleware);
        self
    }

    pub fn bind<C: Controller>(self, controller: C) -> Self {
        self.bind_with(controller, MiddlewareStack::new())
    }

    /// Binds with middleware that runs only for this controller's routes.
    pub fn bind_with<C: Controller>(
        mut self,
        controller: C,
        middleware: impl Into<MiddlewareStack>,
    ) -> Self {
        let group = Group::new("/", MiddlewareStack::new()).bind_with(controller, middleware);
        self.register(group);
        self
    }

    /// Routes under a shared prefix and middleware.
    pub fn group(mut self, prefix: &str, f: impl FnOnce(Group) -> Group) -> Self {
        let group = f(Group::new(prefix, MiddlewareStack::new()));
        self.register(group);
        self
    }

    /// Installs request metrics.
    pub fn metrics(mut self, manager: MetricManager) -> Self {
        self.metrics = Some(manager);
        self
    }

    /// Chooses between envelope and HTTP-native status codes.
    pub fn response_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn register(&mut self, group: Group) {
        let routes = group.into_routes();
        let registry = match self.frozen {
            false => Arc::get_mut(&mut self.registry),
            true => None,
        };
        match registry {
            Some(registry) => routes.into_iter().for_each(|r| registry.register(r)),
            None => tracing::warn!(
                count = routes.len(),
                "server already started, routes ignored"
            ),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Binds the configured address and starts accepting connections.
    pub async fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.config.tls.enable {
            self.config.tls.validate()?;
        }
        let address = self.config.address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Error::wrap(e, format!("binding {}", address)))?;
        self.serve(listener).await
    }

    /// Starts accepting connections on an already bound listener.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<SocketAddr, Error> {
        if !matches!(*self.lifecycle(), Lifecycle::Idle) {
            return Err(Error::msg("server already started"));
        }

        let tls = match self.config.tls.enable {
            true => Some(tls_acceptor(&self.config.tls)?),
            false => None,
        };
        let dispatch = Arc::new(self.dispatch()?);
        self.frozen = true;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::wrap(e, "reading listener address"))?;

        for route in self.registry.iter() {
            tracing::info!(
                method = %route.method,
                path = %route.path,
                handler = %route.handler,
                "route"
            );
        }
        tracing::info!(
            name = %self.config.name,
            %addr,
            tls = tls.is_some(),
            routes = self.registry.len(),
            "server listening"
        );

        let (shutdown, signal) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            dispatch,
            tls,
            signal,
            self.config.graceful_timeout,
        ));
        *self.lifecycle() = Lifecycle::Running(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stops accepting, lets in-flight requests finish within
    /// `graceful_timeout`, then closes what is left.
    ///
    /// Calling it on a server that is not running does nothing.
    pub async fn stop(&self) -> Result<(), Error> {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        tracing::info!(addr = %running.addr, "server stopping");
        if !self.config.graceful_wait_time.is_zero() {
            tokio::time::sleep(self.config.graceful_wait_time).await;
        }
        let _ = running.shutdown.send(());
        let result = running
            .task
            .await
            .map_err(|e| Error::wrap(e, "joining accept loop"))?;
        tracing::info!(addr = %running.addr, ok = result.is_ok(), "server stopped");
        result
    }

    /// Starts, waits for Ctrl-C or SIGTERM, then stops.
    pub async fn run(mut self) -> Result<(), Error> {
        self.start().await?;
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        self.stop().await
    }

    fn base_chain(&self) -> MiddlewareStack {
        let mut stack = MiddlewareStack::new();
        stack.add(RecoveryMiddleware::new());
        stack.add(TracingMiddleware::new());
        if let Some(manager) = &self.metrics {
            stack.add(MetricsMiddleware::new(manager.clone()));
        }
        match self.policy {
            ResponsePolicy::Envelope => stack.add(EnvelopeMiddleware::new()),
            ResponsePolicy::HttpNative => stack.add(HttpNativeMiddleware::new()),
        }
        if !self.config.write_timeout.is_zero() {
            stack.add(TimeoutMiddleware::new(self.config.write_timeout));
        }
        stack.extend(&self.middleware);
        stack
    }

    fn dispatch(&self) -> Result<Dispatch, Error> {
        let base = self.base_chain();
        let mut table = RouteTable::default();

        for route in self.registry.iter() {
            let mut chain = base.clone();
            chain.extend(&route.middleware);
            table.insert(
                route.method.clone(),
                Entry {
                    pattern: route.path.clone(),
                    chain: chain.to_vec(),
                    endpoint: Arc::clone(&route.invoker),
                },
            )?;
        }

        let mut builtins: Vec<(String, Arc<dyn Invoke>)> = Vec::new();
        if self.config.health_check {
            builtins.push(("/health".to_string(), Arc::new(HealthEndpoint)));
        }
        if !self.config.openapi_path.is_empty() {
            builtins.push((
                self.config.openapi_path.clone(),
                Arc::new(OpenApiEndpoint::new(
                    self.config.name.clone(),
                    Arc::clone(&self.registry),
                )),
            ));
            if !self.config.swagger_path.is_empty() {
                builtins.push((
                    self.config.swagger_path.clone(),
                    Arc::new(SwaggerEndpoint::new(
                        &self.config.swagger_template,
                        &self.config.openapi_path,
                    )),
                ));
            }
        }
        if !self.config.metrics_path.is_empty() {
            match &self.metrics {
                Some(manager) => builtins.push((
                    self.config.metrics_path.clone(),
                    Arc::new(MetricsEndpoint::new(manager.clone())),
                )),
                None => tracing::warn!(
                    path = %self.config.metrics_path,
                    "metrics path set without a metric manager, endpoint disabled"
                ),
            }
        }

        for (path, endpoint) in builtins {
            let path = normalise(&path);
            if self.registry.get(&Method::GET, &path).is_some() {
                tracing::warn!(%path, "built-in endpoint shadowed by a bound route");
                continue;
            }
            table.insert(
                Method::GET,
                Entry {
                    pattern: path,
                    chain: base.to_vec(),
                    endpoint,
                },
            )?;
        }

        let fallback = |endpoint: Arc<dyn Invoke>| Entry {
            pattern: String::new(),
            chain: base.to_vec(),
            endpoint,
        };
        Ok(Dispatch {
            table,
            not_found: fallback(Arc::new(StatusEndpoint(StatusCode::NOT_FOUND))),
            not_allowed: fallback(Arc::new(StatusEndpoint(StatusCode::METHOD_NOT_ALLOWED))),
            rejected: fallback(Arc::new(Rejected)),
            validator: Arc::new(Validator::new(self.config.locale)),
            policy: self.policy,
            read_timeout: self.config.read_timeout,
            idle_timeout: self.config.idle_timeout,
            max_header_bytes: self.config.max_header_bytes,
        })
    }
}

/// Ends the chain for requests that failed before routing; their errors are
/// already recorded.
struct Rejected;

impl Invoke for Rejected {
    fn invoke<'a>(&'a self, _req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

#[derive(Debug, Clone, Copy)]
struct Connection {
    remote: SocketAddr,
    local: Option<SocketAddr>,
    tls: bool,
}

/// Everything a connection needs, shared by all of them.
struct Dispatch {
    table: RouteTable,
    not_found: Entry,
    not_allowed: Entry,
    rejected: Entry,
    validator: Arc<Validator>,
    policy: ResponsePolicy,
    read_timeout: Duration,
    idle_timeout: Duration,
    max_header_bytes: usize,
}

impl Dispatch {
    async fn handle(&self, req: hyper::Request<Incoming>, conn: Connection) -> Response<BoxBody> {
        let (parts, body) = req.into_parts();
        let span = tracing::info_span!(
            "request",
            method = %parts.method,
            path = %parts.uri.path(),
            remote = %conn.remote,
        );

        async move {
            let started = Instant::now();
            let (body, failure) = match read_body(body, self.read_timeout).await {
                Ok(body) => (body, None),
                Err(err) => (Bytes::new(), Some(err)),
            };

            let (entry, params) = match (&failure, self.table.lookup(&parts.method, parts.uri.path())) {
                (Some(_), _) => (&self.rejected, PathParams::new()),
                (None, Lookup::Found(entry, params)) => (entry, params),
                (None, Lookup::MethodNotAllowed) => (&self.not_allowed, PathParams::new()),
                (None, Lookup::NotFound) => (&self.not_found, PathParams::new()),
            };
            let route = (!entry.pattern.is_empty()).then(|| entry.pattern.clone());

            let mut request = Request::new(parts, body, Arc::clone(&self.validator))
                .with_connection(Some(conn.remote), conn.local, conn.tls)
                .with_policy(self.policy)
                .with_route(route, params);
            if let Some(err) = failure {
                request.push_error(err);
            }

            Next::new(&entry.chain, entry.endpoint.as_ref())
                .run(&mut request)
                .await;

            let response = request.response().to_response();
            tracing::info!(
                status = response.status().as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                trace_id = %request.trace_id(),
                "request completed"
            );
            response
        }
        .instrument(span)
        .await
    }

    fn http1(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(!self.idle_timeout.is_zero())
            .max_buf_size(self.max_header_bytes.max(MIN_BUF_SIZE));
        // waiting for the next request on a kept-alive connection is bounded
        // by the same header timer
        let header_timeout = match (self.read_timeout.is_zero(), self.idle_timeout.is_zero()) {
            (true, true) => None,
            (false, true) => Some(self.read_timeout),
            (true, false) => Some(self.idle_timeout),
            (false, false) => Some(self.read_timeout.min(self.idle_timeout)),
        };
        builder.header_read_timeout(header_timeout);
        builder
    }
}

async fn read_body(body: Incoming, limit: Duration) -> Result<Bytes, Error> {
    let collect = body.collect();
    let collected = if limit.is_zero() {
        collect.await
    } else {
        tokio::time::timeout(limit, collect).await.map_err(|_| {
            Error::invalid_parameter("timed out reading request body")
                .with_status(StatusCode::REQUEST_TIMEOUT)
        })?
    };
    collected.map(|c| c.to_bytes()).map_err(|e| {
        Error::wrap_code(Code::INVALID_PARAMETER, e, "reading request body")
            .with_status(StatusCode::BAD_REQUEST)
    })
}

async fn serve_connection<IO>(io: IO, watcher: Watcher, dispatch: Arc<Dispatch>, conn: Connection)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = dispatch.http1();
    let service = service_fn(move |req| {
        let dispatch = Arc::clone(&dispatch);
        async move { Ok::<_, Infallible>(dispatch.handle(req, conn).await) }
    });
    let connection = builder.serve_connection(TokioIo::new(io), service);
    if let Err(err) = watcher.watch(connection).await {
        tracing::debug!(remote = %conn.remote, error = %err, "connection closed with error");
    }
}

fn is_connection_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

async fn accept_loop(
    listener: TcpListener,
    dispatch: Arc<Dispatch>,
    tls: Option<TlsAcceptor>,
    mut signal: oneshot::Receiver<()>,
    graceful_timeout: Duration,
) -> Result<(), Error> {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();
    let local = listener.local_addr().ok();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_connection_error(&err) => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let conn = Connection { remote, local, tls: tls.is_some() };
                let watcher = graceful.watcher();
                let dispatch = Arc::clone(&dispatch);
                match tls.clone() {
                    None => {
                        connections.spawn(serve_connection(stream, watcher, dispatch, conn));
                    }
                    Some(acceptor) => {
                        connections.spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(stream) => serve_connection(stream, watcher, dispatch, conn).await,
                                Err(err) => tracing::debug!(%remote, error = %err, "TLS handshake failed"),
                            }
                        });
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut signal => break,
        }
    }

    drop(listener);
    let open = connections.len();
    tracing::debug!(open, "draining connections");

    let drain = async {
        graceful.shutdown().await;
        while connections.join_next().await.is_some() {}
    };
    let drained = match graceful_timeout.is_zero() {
        true => Ok(drain.await),
        false => tokio::time::timeout(graceful_timeout, drain).await,
    };
    match drained {
        Ok(()) => Ok(()),
        Err(_) => {
            let aborted = connections.len();
            connections.abort_all();
            Err(Error::internal(format!(
                "graceful shutdown timed out after {:?}, {} connections closed",
                graceful_timeout, aborted
            )))
        }
    }
}

fn tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, Error> {
    config.validate()?;

    let open = |path: &str| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::wrap(e, format!("opening {}", path)))
    };

    let certs = rustls_pemfile::certs(&mut open(&config.cert_file)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::wrap(e, format!("parsing certificates in {}", config.cert_file)))?;
    if certs.is_empty() {
        return Err(Error::msg(format!("no certificates found in {}", config.cert_file)));
    }
    let key = rustls_pemfile::private_key(&mut open(&config.key_file)?)
        .map_err(|e| Error::wrap(e, format!("parsing private key in {}", config.key_file)))?
        .ok_or_else(|| Error::msg(format!("no private key found in {}", config.key_file)))?;

    let mut server_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::wrap(e, "configuring TLS"))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::wrap(e, "configuring TLS"))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let server = Server::new(ServerConfig::default());
        assert!(server.stop().await.is_ok());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut server = Server::new(ServerConfig::from_map([("address", "127.0.0.1:0")]).unwrap());
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.start().await.is_err());

        server.stop().await.unwrap();
        assert!(server.stop().await.is_ok());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_tls_without_files_fails() {
        let mut server = Server::new(
            ServerConfig::from_map([("address", "127.0.0.1:0"), ("tlsEnable", "true")]).unwrap(),
        );
        let err = server.start().await.unwrap_err();
        assert!(err.to_string().contains("configuration"));
        assert!(!server.is_running());
    }

    #[test]
    fn test_dispatch_carries_timeouts() {
        let mut server = Server::new(ServerConfig::default());
        server.config.read_timeout = Duration::from_secs(5);
        server.config.idle_timeout = Duration::from_secs(2);
        let dispatch = server.dispatch().unwrap();
        assert_eq!(dispatch.read_timeout, Duration::from_secs(5));
        assert_eq!(dispatch.idle_timeout, Duration::from_secs(2));
        // building the connection config must not panic on small header limits
        let _ = Dispatch {
            max_header_bytes: 1,
            ..dispatch
        }
        .http1();
    }

    #[test]
    fn test_write_timeout_joins_the_chain() {
        let mut server = Server::new(ServerConfig::default());
        assert_eq!(server.base_chain().len(), 3);

        server.config.write_timeout = Duration::from_millis(100);
        assert_eq!(server.base_chain().len(), 4);
    }
}
