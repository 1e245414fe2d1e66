use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::error::Error;
use crate::request::Request;
use crate::response::materialize;

use super::{BoxFuture, Middleware, Next};

/// Turns panics below it into `INTERNAL_ERROR` responses.
///
/// The panic message ends up in the envelope as `Panic recovered: <msg>`; the
/// connection and the server keep running.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMiddleware;

impl RecoveryMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for RecoveryMiddleware {
    fn handle<'a>(&'a self, req: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(run_guarded(next, req))
    }
}

/// Runs the rest of the chain and recovers a panic into the request's errors
/// and a materialised response.
pub(crate) async fn run_guarded(next: Next<'_>, req: &mut Request) {
    let outcome = AssertUnwindSafe(next.run(&mut *req)).catch_unwind().await;
    if let Err(payload) = outcome {
        recover(req, payload);
    }
}

fn recover(req: &mut Request, payload: Box<dyn Any + Send>) {
    let message = panic_message(payload.as_ref());
    let err = Error::internal(format!("Panic recovered: {}", message));
    tracing::error!(
        trace_id = %req.trace_id(),
        panic = %message,
        stack = %err.stack(),
        "handler panicked"
    );
    req.push_error(err);
    let policy = req.policy();
    materialize(req, policy);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::middleware::{Invoke, MiddlewareStack};
    use crate::testing::TestRequest;

    struct Boom(&'static str);

    impl Invoke for Boom {
        fn invoke<'a>(&'a self, _req: &'a mut Request) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if !self.0.is_empty() {
                    panic!("{}", self.0);
                }
            })
        }
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let mut stack = MiddlewareStack::new();
        stack.add(RecoveryMiddleware::new());
        let mut req = TestRequest::get("/").build();

        stack.execute(&mut req, &Boom("boom")).now_or_never().unwrap();

        let err = req.error().unwrap();
        assert_eq!(err.code(), Code::INTERNAL_ERROR);
        assert_eq!(err.message(), "Panic recovered: boom");
        assert!(req.response().is_written());
        assert_eq!(req.status(), http::StatusCode::OK);
    }

    #[test]
    fn test_panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_message(owned.as_ref()), "code 7");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
