//! Prometheus request metrics.

pub mod middleware;
mod prometheus;

pub use self::middleware::MetricsMiddleware;
pub use self::prometheus::{MetricManager, MetricsEndpoint};
