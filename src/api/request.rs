//! Request method and per-call options.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    }
  }

  pub fn is_mutation(self) -> bool {
    !matches!(self, Self::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "DELETE" | "DEL" => Ok(Self::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// Per-call options for [`ApiClient`](super::ApiClient) requests.
///
/// Unset fields fall back to the client's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
  pub timeout: Option<Duration>,
  /// Caller-owned cancellation. Requests carrying one are never deduplicated.
  pub cancel: Option<CancellationToken>,
  /// Override whether the retry loop runs. Defaults to GET only.
  pub retry: Option<bool>,
  pub max_retries: Option<u32>,
  /// Cache the GET response for this long. `None` or zero disables caching.
  pub cache_ttl: Option<Duration>,
  /// Cache with the client's default TTL when `cache_ttl` is unset.
  pub cached: bool,
  /// Serve an expired cache entry for this long after it was written when
  /// the refetch fails recoverably.
  pub stale_if_error: Option<Duration>,
  pub idempotency_key: Option<String>,
  pub idempotency_prefix: Option<String>,
  /// Set to `Some(false)` to skip the data-changed notification after a
  /// successful mutation.
  pub notify_data_update: Option<bool>,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn retry(mut self, enabled: bool) -> Self {
    self.retry = Some(enabled);
    self
  }

  pub fn max_retries(mut self, retries: u32) -> Self {
    self.max_retries = Some(retries);
    self
  }

  pub fn cache_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn cached(mut self) -> Self {
    self.cached = true;
    self
  }

  pub fn stale_if_error(mut self, window: Duration) -> Self {
    self.stale_if_error = Some(window);
    self
  }

  pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }

  pub fn idempotency_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.idempotency_prefix = Some(prefix.into());
    self
  }

  pub fn notify_data_update(mut self, notify: bool) -> Self {
    self.notify_data_update = Some(notify);
    self
  }
}
