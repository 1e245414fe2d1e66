//! Testing utilities for Maltose applications.
//!
//! [`TestRequest`] builds a request in memory for middleware and binder
//! tests; [`TestClient`] runs a real server on a random port.

mod client;
mod request;

pub use client::{TestClient, TestRequestBuilder, TestResponse};
pub use request::TestRequest;
