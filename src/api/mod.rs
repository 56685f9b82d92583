//! Resilient request layer for the platform API.
//!
//! [`ApiClient`] is the entry point. Each call flows through:
//! - the GET response cache (opt-in per call, with a stale-if-error window)
//! - in-flight deduplication of identical concurrent GETs
//! - the per-endpoint circuit breaker
//! - a bounded retry loop around one [`RequestExecutor`] exchange
//!
//! and ends by publishing exactly one success or failure event.

pub mod cache;
pub mod circuit;
mod client;
pub mod dedupe;
mod error;
pub mod executor;
pub mod idempotency;
mod request;
pub mod transport;

pub use cache::{CacheHit, CacheSettings, CacheSource, ResponseCache};
pub use circuit::{CircuitBreaker, CircuitSettings, CircuitState};
pub use client::{ApiClient, ClientSettings, RetrySettings};
pub use error::{ApiError, ApiErrorCode};
pub use executor::RequestExecutor;
pub use request::{Method, RequestOptions};
pub use transport::{HttpTransport, ReqwestTransport};
