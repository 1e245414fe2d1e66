use std::time::Instant;

use prometheus::IntGauge;

use crate::middleware::{BoxFuture, Middleware, Next, run_guarded};
use crate::observability::protocol_version;
use crate::request::Request;

use super::prometheus::MetricManager;

/// Records duration, counts and body sizes for every request.
///
/// The in-flight gauge goes up once on entry and down once on exit, panics
/// included.
pub struct MetricsMiddleware {
    manager: MetricManager,
}

impl MetricsMiddleware {
    pub fn new(manager: MetricManager) -> Self {
        Self { manager }
    }
}

/// Replaces pure-numeric path segments with `:id` to avoid label cardinality explosion.
/// e.g `/users/123/posts` -> `/users/:id/posts`
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn request_labels(req: &Request) -> Vec<String> {
    let (address, port) = match req.local_addr() {
        Some(addr) => (addr.ip().to_string(), addr.port().to_string()),
        None => (String::new(), String::new()),
    };
    let route = req
        .route()
        .map(str::to_string)
        .unwrap_or_else(|| normalize_path(req.path()));
    vec![
        address,
        port,
        route,
        req.scheme().to_string(),
        req.method().to_string(),
        protocol_version(req.version()).to_string(),
    ]
}

struct InFlight(IntGauge);

impl InFlight {
    fn enter(gauge: IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl Middleware for MetricsMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let instruments = &self.manager.instruments;
            let mut labels = request_labels(req);
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _in_flight = InFlight::enter(instruments.in_flight.with_label_values(&refs));
            let start = Instant::now();

            run_guarded(next, &mut *req).await;

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            labels.push(req.status().as_u16().to_string());
            labels.push(
                req.error()
                    .map(|err| err.code().value().to_string())
                    .unwrap_or_default(),
            );
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();

            instruments.duration.with_label_values(&refs).observe(elapsed_ms);
            instruments.total.with_label_values(&refs).inc();
            instruments
                .duration_total
                .with_label_values(&refs)
                .inc_by(elapsed_ms.round() as u64);
            instruments
                .request_body_size
                .with_label_values(&refs)
                .inc_by(req.body().len() as u64);
            instruments
                .response_body_size
                .with_label_values(&refs)
                .inc_by(req.response().bytes_written() as u64);
        })
    }
}
