//! Token-bucket rate limiting keyed by client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::StatusCode;
use http::header::{HeaderValue, RETRY_AFTER};

use crate::error::Error;
use crate::request::Request;

use super::{BoxFuture, Middleware, Next};

type KeyExtractorFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Stale buckets are pruned once every this many checks.
const CLEANUP_INTERVAL: u64 = 1000;

/// Buckets untouched for this long are dropped; a dropped bucket comes back
/// full.
const STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refills for the time since the last check, then takes one token.
    /// Fails with the wait until the next token.
    fn take(&mut self, now: Instant, rate: f64, capacity: f64) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        // a bucket that never refills waits until it is pruned
        Err(Duration::try_from_secs_f64((1.0 - self.tokens) / rate).unwrap_or(STALE_AFTER))
    }

    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_refill) >= STALE_AFTER
    }
}

/// Identifies the client a request counts against.
#[derive(Clone)]
pub enum KeyExtractor {
    /// `X-Forwarded-For` (leftmost), then `X-Real-IP`, then the peer address.
    Ip,
    /// The client IP and the matched route pattern, so each endpoint has its
    /// own budget per client.
    IpAndRoute,
    Custom(KeyExtractorFn),
}

impl std::fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyExtractor::Ip => f.write_str("KeyExtractor::Ip"),
            KeyExtractor::IpAndRoute => f.write_str("KeyExtractor::IpAndRoute"),
            KeyExtractor::Custom(_) => f.write_str("KeyExtractor::Custom(..)"),
        }
    }
}

impl KeyExtractor {
    pub fn custom(f: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        KeyExtractor::Custom(Arc::new(f))
    }

    fn extract(&self, req: &Request) -> String {
        match self {
            KeyExtractor::Ip => client_ip(req),
            KeyExtractor::IpAndRoute => {
                let route = req.route().unwrap_or(req.path());
                format!("{} {} {}", client_ip(req), req.method(), route)
            }
            KeyExtractor::Custom(f) => f(req),
        }
    }
}

fn client_ip(req: &Request) -> String {
    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(|ip| ip.trim().to_string())
        .or_else(|| req.remote_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
    pub key_extractor: KeyExtractor,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            key_extractor: KeyExtractor::Ip,
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests as f64 / 60.0, requests)
    }

    pub fn with_key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.key_extractor = extractor;
        self
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_key: DashMap<String, TokenBucket>,
    request_count: AtomicU64,
}

/// Rejects clients that run out of tokens with `SERVER_BUSY`, HTTP 429 and a
/// `retry-after` header.
///
/// Buckets refill lazily on each check, so there is no background task.
/// Clones share buckets.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    buckets: Arc<Buckets>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::default(),
        }
    }

    fn cleanup_stale_buckets(&self, now: Instant) {
        self.buckets.by_key.retain(|_, bucket| !bucket.is_stale(now));
    }

    /// Takes a token for `key`; `Err` carries the whole seconds to wait.
    fn check_rate_limit(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let count = self.buckets.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            self.cleanup_stale_buckets(now);
        }

        let capacity = f64::from(self.config.burst);
        self.buckets
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(capacity, now))
            .take(now, self.config.requests_per_second, capacity)
            .map_err(|wait| wait.as_secs_f64().ceil().max(1.0) as u64)
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = self.config.key_extractor.extract(req);
            let Err(retry_after) = self.check_rate_limit(&key) else {
                return next.run(req).await;
            };

            tracing::debug!(%key, retry_after, "rate limited");
            req.response()
                .insert_header(RETRY_AFTER, HeaderValue::from(retry_after));
            req.push_error(
                Error::server_busy("too many requests").with_status(StatusCode::TOO_MANY_REQUESTS),
            );
        })
    }
}
