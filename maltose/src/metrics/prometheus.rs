use std::sync::Arc;

use http::StatusCode;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::Error;
use crate::middleware::{BoxFuture, Invoke};
use crate::request::Request;

/// Labels shared by every instrument.
pub(crate) const REQUEST_LABELS: [&str; 6] = [
    "server_address",
    "server_port",
    "http_route",
    "url_scheme",
    "http_request_method",
    "network_protocol_version",
];

/// Request labels plus the outcome.
pub(crate) const RESPONSE_LABELS: [&str; 8] = [
    "server_address",
    "server_port",
    "http_route",
    "url_scheme",
    "http_request_method",
    "network_protocol_version",
    "http_response_status_code",
    "error_code",
];

const DURATION_BUCKETS_MS: [f64; 12] = [
    1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

#[derive(Clone)]
pub(crate) struct Instruments {
    pub duration: HistogramVec,
    pub total: IntCounterVec,
    pub in_flight: IntGaugeVec,
    pub duration_total: IntCounterVec,
    pub request_body_size: IntCounterVec,
    pub response_body_size: IntCounterVec,
}

/// HTTP server instruments over a private Prometheus registry.
///
/// Owned by the server; clones share the same registry.
#[derive(Clone)]
pub struct MetricManager {
    registry: Arc<Registry>,
    pub(crate) instruments: Instruments,
}

impl std::fmt::Debug for MetricManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricManager").finish_non_exhaustive()
    }
}

fn register<C: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, Error> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::wrap(e, "registering metric"))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &RESPONSE_LABELS)
        .map_err(|e| Error::wrap(e, format!("creating metric {}", name)))?;
    register(registry, counter)
}

impl MetricManager {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "http_server_request_duration_ms",
                "Duration of HTTP server requests in milliseconds",
            )
            .buckets(DURATION_BUCKETS_MS.to_vec()),
            &RESPONSE_LABELS,
        )
        .map_err(|e| Error::wrap(e, "creating metric http_server_request_duration_ms"))?;
        let duration = register(&registry, duration)?;

        let in_flight = IntGaugeVec::new(
            Opts::new(
                "http_server_requests_in_flight",
                "Number of HTTP server requests currently being processed",
            ),
            &REQUEST_LABELS,
        )
        .map_err(|e| Error::wrap(e, "creating metric http_server_requests_in_flight"))?;
        let in_flight = register(&registry, in_flight)?;

        let instruments = Instruments {
            duration,
            total: counter(
                &registry,
                "http_server_requests_total",
                "Total number of HTTP server requests",
            )?,
            in_flight,
            duration_total: counter(
                &registry,
                "http_server_request_duration_ms_total",
                "Total time spent serving HTTP requests in milliseconds",
            )?,
            request_body_size: counter(
                &registry,
                "http_server_request_body_size_bytes_total",
                "Total size of HTTP request bodies in bytes",
            )?,
            response_body_size: counter(
                &registry,
                "http_server_response_body_size_bytes_total",
                "Total size of HTTP response bodies in bytes",
            )?,
        };

        Ok(Self {
            registry: Arc::new(registry),
            instruments,
        })
    }

    /// Encodes all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Current in-flight count for one label set.
    pub fn in_flight(&self, labels: &[&str]) -> i64 {
        self.instruments
            .in_flight
            .get_metric_with_label_values(labels)
            .map(|gauge| gauge.get())
            .unwrap_or_default()
    }
}

/// Serves [`MetricManager::encode`] on the configured metrics path.
pub struct MetricsEndpoint {
    manager: MetricManager,
}

impl MetricsEndpoint {
    pub fn new(manager: MetricManager) -> Self {
        Self { manager }
    }
}

impl Invoke for MetricsEndpoint {
    fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            req.response().write(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                self.manager.encode(),
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: [&str; 8] = ["127.0.0.1", "8000", "/health", "http", "GET", "1.1", "200", ""];

    #[test]
    fn test_encode_prometheus_format() {
        let manager = MetricManager::new().unwrap();
        manager.instruments.total.with_label_values(&LABELS).inc();

        let output = manager.encode();
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
        assert!(output.contains("http_server_requests_total"));
        assert!(output.contains(r#"http_route="/health""#));
        assert!(output.contains(r#"http_response_status_code="200""#));
    }

    #[test]
    fn test_managers_do_not_share_state() {
        let first = MetricManager::new().unwrap();
        let second = MetricManager::new().unwrap();
        first.instruments.total.with_label_values(&LABELS).inc();

        assert!(first.encode().contains("http_server_requests_total"));
        assert!(!second.encode().contains("http_server_requests_total{"));
    }

    #[test]
    fn test_clone_shares_state() {
        let manager = MetricManager::new().unwrap();
        let clone = manager.clone();
        manager.instruments.in_flight.with_label_values(&LABELS[..6]).inc();
        assert_eq!(clone.in_flight(&LABELS[..6]), 1);
    }

    #[test]
    fn test_histogram_observe() {
        let manager = MetricManager::new().unwrap();
        manager
            .instruments
            .duration
            .with_label_values(&LABELS)
            .observe(42.0);

        let output = manager.encode();
        assert!(output.contains("http_server_request_duration_ms_bucket"));
        assert!(output.contains(r#"le="50""#));
    }
}
