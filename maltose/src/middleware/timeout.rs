use std::time::Duration;

use http::StatusCode;

use crate::error::{Code, Error};
use crate::request::Request;
use crate::response::Envelope;

use super::{BoxFuture, Middleware, Next};

/// Answers `SERVER_BUSY` with HTTP 503 when the rest of the chain takes longer
/// than `duration`.
///
/// The server installs it below tracing and metrics when `writeTimeout` is
/// set, so a timed-out request is still counted and its span still closes.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Default for TimeoutMiddleware {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if tokio::time::timeout(self.duration, next.run(&mut *req))
                .await
                .is_ok()
            {
                return;
            }

            tracing::warn!(
                trace_id = %req.trace_id(),
                timeout_ms = self.duration.as_millis() as u64,
                "request exceeded the write timeout"
            );
            let writer = req.response().clone();
            if writer.is_written() {
                return;
            }
            req.push_error(
                Error::server_busy("request timed out").with_status(StatusCode::SERVICE_UNAVAILABLE),
            );
            let envelope = Envelope::<()>::failure(Code::SERVER_BUSY, "request timed out");
            if let Err(err) = writer.write_json(StatusCode::SERVICE_UNAVAILABLE, &envelope) {
                tracing::error!(error = %err, "failed to write timeout response");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Invoke, MiddlewareStack};
    use crate::testing::TestRequest;

    struct Sleep(Duration);

    impl Invoke for Sleep {
        fn invoke<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                req.set_payload(crate::response::Payload::Text("late".into()));
            })
        }
    }

    fn stack(duration: Duration) -> MiddlewareStack {
        let mut stack = MiddlewareStack::new();
        stack.add(TimeoutMiddleware::new(duration));
        stack
    }

    #[tokio::test]
    async fn test_slow_chain_is_server_busy() {
        let mut req = TestRequest::get("/slow").build();
        stack(Duration::from_millis(20))
            .execute(&mut req, &Sleep(Duration::from_secs(2)))
            .await;

        assert_eq!(req.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(req.response().is_written());
        assert_eq!(req.error().map(|e| e.code()), Some(Code::SERVER_BUSY));
    }

    #[tokio::test]
    async fn test_fast_chain_untouched() {
        let mut req = TestRequest::get("/fast").build();
        stack(Duration::from_secs(2))
            .execute(&mut req, &Sleep(Duration::from_millis(1)))
            .await;

        assert!(req.error().is_none());
        assert!(!req.response().is_written());
    }
}
