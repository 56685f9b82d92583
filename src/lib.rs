//! Resilient request layer for the tutoring platform client.
//!
//! [`api::ApiClient`] wraps every backend call with caching, in-flight
//! deduplication, a per-endpoint circuit breaker and bounded retries.
//! Mutations that fail transiently are queued in the durable
//! [`outbox::OutboxQueue`] and replayed in order once the
//! [`connectivity::ConnectivityMonitor`] sees the backend again.

pub mod action_guard;
pub mod api;
pub mod app;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod event;
pub mod logging;
pub mod outbox;
pub mod retry_action;
pub mod signals;
pub mod single_flight;
pub mod storage;

#[cfg(test)]
mod test_support;
