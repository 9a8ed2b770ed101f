//! REST API access for the VisaHub backend.
//!
//! This module provides the `ApiClient` for calling the backend, the
//! `RequestExecutor` that every call goes through (credential attachment,
//! refresh-and-replay on 401, backoff on timeouts), and the shared
//! `RetryPolicy`.

pub mod client;
pub mod error;
pub mod executor;
pub mod retry;

pub use client::ApiClient;
pub use error::ApiError;
pub use executor::RequestExecutor;
pub use retry::RetryPolicy;
