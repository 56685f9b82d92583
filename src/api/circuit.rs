//! Per-endpoint circuit breaker for GET requests.
//!
//! ```text
//! Closed ──(threshold recoverable failures within window)──▶ Open
//!   ▲                                                         │
//!   └──────(cooldown elapsed, next call goes through)─────────┘
//! ```
//!
//! Any success clears the endpoint's entry. Mutations are never gated.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::error::ApiError;
use super::request::Method;
use crate::backoff::BackoffPolicy;
use crate::clock::{span, Clock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitSettings {
  pub failure_threshold: usize,
  /// Trailing window in which failures are counted.
  pub window: Duration,
  pub cooldown: BackoffPolicy,
}

impl Default for CircuitSettings {
  fn default() -> Self {
    Self {
      failure_threshold: 4,
      window: Duration::from_secs(30),
      cooldown: BackoffPolicy::fixed(Duration::from_secs(15)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  Closed,
  Open { until: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct CircuitEntry {
  failures: Vec<DateTime<Utc>>,
  open_until: Option<DateTime<Utc>>,
}

impl CircuitEntry {
  fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - span(window);
    self.failures.retain(|at| *at > cutoff);
    if self.open_until.is_some_and(|until| until <= now) {
      self.open_until = None;
    }
  }
}

pub struct CircuitBreaker {
  entries: Mutex<HashMap<String, CircuitEntry>>,
  settings: CircuitSettings,
  clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
  pub fn new(settings: CircuitSettings, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      settings,
      clock,
    }
  }

  fn key(method: Method, path: &str) -> String {
    format!("{}:{}", method, path)
  }

  fn tracked(method: Method) -> bool {
    method == Method::Get
  }

  /// Fail fast with `circuit_open` while the endpoint's circuit is open.
  pub fn check(&self, method: Method, path: &str) -> Result<(), ApiError> {
    match self.state(method, path) {
      CircuitState::Closed => Ok(()),
      CircuitState::Open { .. } => Err(ApiError::circuit_open(method.as_str(), path)),
    }
  }

  pub fn state(&self, method: Method, path: &str) -> CircuitState {
    if !Self::tracked(method) {
      return CircuitState::Closed;
    }
    let now = self.clock.now();
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(entry) = entries.get_mut(&Self::key(method, path)) else {
      return CircuitState::Closed;
    };
    entry.prune(now, self.settings.window);
    match entry.open_until {
      Some(until) => CircuitState::Open { until },
      None => CircuitState::Closed,
    }
  }

  pub fn record_success(&self, method: Method, path: &str) {
    if !Self::tracked(method) {
      return;
    }
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&Self::key(method, path));
  }

  /// Count a failure. Returns true when this failure opened the circuit.
  pub fn record_failure(&self, method: Method, path: &str, error: &ApiError) -> bool {
    if !Self::tracked(method) || !error.is_recoverable() {
      return false;
    }
    let now = self.clock.now();
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = entries.entry(Self::key(method, path)).or_default();
    entry.prune(now, self.settings.window);
    entry.failures.push(now);

    if entry.open_until.is_none() && entry.failures.len() >= self.settings.failure_threshold {
      let until = now + span(self.settings.cooldown.delay(1));
      entry.open_until = Some(until);
      tracing::info!(
        method = %method,
        path,
        failures = entry.failures.len(),
        %until,
        "Circuit opened"
      );
      return true;
    }
    false
  }
}
