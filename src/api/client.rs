//! Request orchestration: cache, dedupe, circuit, retry loop and telemetry
//! around the single-exchange executor.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::cache::{CacheSettings, ResponseCache};
use super::circuit::{CircuitBreaker, CircuitSettings};
use super::dedupe::InflightDeduplicator;
use super::error::{ApiError, ApiErrorCode};
use super::executor::{Exchange, RequestExecutor};
use super::idempotency::{self, DEFAULT_PREFIX};
use super::request::{Method, RequestOptions};
use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::event::{ApiEvent, ApiEvents, ApiFailure, ApiSuccess};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Statuses retried even when their code alone is not recoverable.
  pub retryable_statuses: BTreeSet<u16>,
}

impl RetrySettings {
  pub fn backoff(&self) -> BackoffPolicy {
    BackoffPolicy::new(self.base_delay, self.max_delay).with_jitter(0.2, 0.6)
  }
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_retries: 1,
      base_delay: Duration::from_millis(250),
      max_delay: Duration::from_millis(1250),
      retryable_statuses: BTreeSet::from([408, 425, 429, 500, 502, 503, 504]),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
  pub retry: RetrySettings,
  pub circuit: CircuitSettings,
  pub cache: CacheSettings,
  pub idempotency_prefix: String,
}

impl Default for ClientSettings {
  fn default() -> Self {
    Self {
      retry: RetrySettings::default(),
      circuit: CircuitSettings::default(),
      cache: CacheSettings::default(),
      idempotency_prefix: DEFAULT_PREFIX.to_string(),
    }
  }
}

/// The public request surface. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
}

struct ClientInner {
  executor: RequestExecutor,
  settings: ClientSettings,
  circuit: CircuitBreaker,
  cache: ResponseCache,
  dedupe: InflightDeduplicator,
  clock: Arc<dyn Clock>,
  events: ApiEvents,
}

impl ApiClient {
  pub fn new(
    executor: RequestExecutor,
    settings: ClientSettings,
    clock: Arc<dyn Clock>,
    events: ApiEvents,
  ) -> Self {
    let circuit = CircuitBreaker::new(settings.circuit, Arc::clone(&clock));
    let cache = ResponseCache::new(settings.cache, Arc::clone(&clock));
    Self {
      inner: Arc::new(ClientInner {
        executor,
        settings,
        circuit,
        cache,
        dedupe: InflightDeduplicator::new(),
        clock,
        events,
      }),
    }
  }

  pub fn executor(&self) -> &RequestExecutor {
    &self.inner.executor
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.inner.cache
  }

  pub fn circuit(&self) -> &CircuitBreaker {
    &self.inner.circuit
  }

  pub fn events(&self) -> &ApiEvents {
    &self.inner.events
  }

  pub fn clock(&self) -> Arc<dyn Clock> {
    Arc::clone(&self.inner.clock)
  }

  pub fn settings(&self) -> &ClientSettings {
    &self.inner.settings
  }

  pub async fn get(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
    self.request(Method::Get, path, options).await
  }

  pub async fn post(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
    self.request(Method::Post, path, options).await
  }

  pub async fn put(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
    self.request(Method::Put, path, options).await
  }

  pub async fn del(&self, path: &str, options: RequestOptions) -> Result<Value, ApiError> {
    self.request(Method::Delete, path, options).await
  }

  /// GET and deserialize the body.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    decode(self.get(path, options).await?)
  }

  /// Send `body` as JSON with the given mutation method and deserialize
  /// the response.
  pub async fn send_json<B: Serialize, T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: &B,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    let body = serde_json::to_value(body).map_err(|e| {
      ApiError::new(ApiErrorCode::Validation, format!("Request body is not JSON: {}", e))
    })?;
    decode(self.request(method, path, options.body(body)).await?)
  }

  pub async fn request(
    &self,
    method: Method,
    path: &str,
    options: RequestOptions,
  ) -> Result<Value, ApiError> {
    if method.is_mutation() {
      return self.inner.execute(method, path.to_string(), options, None).await;
    }

    let cache_key = ResponseCache::key(path, &options.headers);
    if self.inner.cache.effective_ttl(options.cache_ttl, options.cached).is_some() {
      if let Some(hit) = self.inner.cache.get_fresh(&cache_key) {
        debug!(path, "Serving cached response");
        return Ok(hit.data);
      }
    }

    if options.cancel.is_some() {
      return self
        .inner
        .execute(method, path.to_string(), options, Some(cache_key))
        .await;
    }

    let inner = Arc::clone(&self.inner);
    let path = path.to_string();
    let key = cache_key.clone();
    self
      .inner
      .dedupe
      .run(cache_key, move || async move {
        inner.execute(method, path, options, Some(key)).await
      })
      .await
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value)
    .map_err(|e| ApiError::new(ApiErrorCode::Unknown, format!("Unexpected response shape: {}", e)))
}

impl ClientInner {
  /// Run one logical request to a terminal outcome and record it.
  async fn execute(
    &self,
    method: Method,
    path: String,
    options: RequestOptions,
    cache_key: Option<String>,
  ) -> Result<Value, ApiError> {
    let request_id = uuid::Uuid::new_v4().to_string();

    let result = match self.circuit.check(method, &path) {
      Ok(()) => self.attempt(method, &path, &options, &request_id).await,
      Err(err) => Err(err.with_request_id(&request_id)),
    };

    match result {
      Ok(data) => {
        self.on_success(method, &path, &options, cache_key.as_deref(), &data);
        Ok(data)
      }
      Err(err) if err.is_cancelled() => Err(err),
      Err(err) => {
        self.on_failure(method, &path, &err);
        if let Some(stale) = self.stale_fallback(method, &options, cache_key.as_deref(), &err) {
          return Ok(stale);
        }
        Err(err)
      }
    }
  }

  /// The retry loop. Nothing here touches cache or circuit state.
  async fn attempt(
    &self,
    method: Method,
    path: &str,
    options: &RequestOptions,
    request_id: &str,
  ) -> Result<Value, ApiError> {
    let retry = &self.settings.retry;
    let retry_enabled = options.retry.unwrap_or(method == Method::Get);
    let max_retries = options.max_retries.unwrap_or(retry.max_retries);

    let mut headers: BTreeMap<String, String> = options.headers.clone();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
    let prefix = options
      .idempotency_prefix
      .as_deref()
      .unwrap_or(&self.settings.idempotency_prefix);
    idempotency::provision(
      &mut headers,
      method,
      options.idempotency_key.as_deref(),
      prefix,
    );

    let mut attempt: u32 = 0;
    loop {
      headers.insert(RETRY_ATTEMPT_HEADER.to_string(), attempt.to_string());
      let exchange = Exchange {
        method,
        path: path.to_string(),
        headers: headers.clone(),
        body: options.body.clone(),
        timeout: options.timeout,
        cancel: options.cancel.clone(),
      };

      let err = match self.executor.execute(exchange).await {
        Ok(data) => return Ok(data),
        Err(err) => self.flag_retryable(err).with_request_id(request_id),
      };

      if err.is_cancelled() || !retry_enabled || attempt >= max_retries || !err.is_recoverable() {
        debug!(method = %method, path, attempt, code = %err.code, "Request failed");
        return Err(err);
      }

      attempt += 1;
      let delay = retry.backoff().delay(attempt);
      warn!(
        method = %method,
        path,
        attempt,
        code = %err.code,
        delay_ms = delay.as_millis() as u64,
        "Request failed, retrying"
      );

      match &options.cancel {
        Some(token) => {
          tokio::select! {
            _ = token.cancelled() => return Err(ApiError::cancelled().with_request_id(request_id)),
            _ = tokio::time::sleep(delay) => {}
          }
        }
        None => tokio::time::sleep(delay).await,
      }
    }
  }

  fn flag_retryable(&self, err: ApiError) -> ApiError {
    let by_status = err
      .status
      .is_some_and(|status| self.settings.retry.retryable_statuses.contains(&status));
    let retryable = !err.is_cancelled() && (err.code.is_recoverable() || by_status);
    err.with_retryable(retryable)
  }

  fn on_success(
    &self,
    method: Method,
    path: &str,
    options: &RequestOptions,
    cache_key: Option<&str>,
    data: &Value,
  ) {
    let now = self.clock.now();
    if method.is_mutation() {
      self.cache.clear();
      if options.notify_data_update != Some(false) {
        self.events.emit(ApiEvent::DataChanged {
          path: path.to_string(),
          method,
          timestamp: now,
        });
      }
    } else {
      self.circuit.record_success(method, path);
      let ttl = self.cache.effective_ttl(options.cache_ttl, options.cached);
      if let (Some(key), Some(ttl)) = (cache_key, ttl) {
        self
          .cache
          .store(key, data.clone(), ttl, options.stale_if_error);
      }
    }

    self.events.emit(ApiEvent::Success(ApiSuccess {
      path: path.to_string(),
      method,
      timestamp: now,
    }));
  }

  fn on_failure(&self, method: Method, path: &str, err: &ApiError) {
    // A rejected call never reached the endpoint, so it says nothing new about it.
    if err.code != ApiErrorCode::CircuitOpen {
      self.circuit.record_failure(method, path, err);
    }
    self.events.emit(ApiEvent::Failure(ApiFailure {
      code: err.code,
      status: err.status,
      request_id: err.request_id.clone(),
      retryable: err.is_recoverable(),
      path: path.to_string(),
      method,
      timestamp: self.clock.now(),
    }));
  }

  fn stale_fallback(
    &self,
    method: Method,
    options: &RequestOptions,
    cache_key: Option<&str>,
    err: &ApiError,
  ) -> Option<Value> {
    if method.is_mutation() || options.stale_if_error.is_none() || !err.is_recoverable() {
      return None;
    }
    let hit = self.cache.get_stale(cache_key?)?;
    warn!(code = %err.code, cached_at = %hit.cached_at, "Serving stale response after failure");
    Some(hit.data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::circuit::CircuitState;
  use crate::test_support::{Harness, Scripted};
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tokio::sync::broadcast::error::TryRecvError;
  use tokio_util::sync::CancellationToken;

  fn drain(rx: &mut tokio::sync::broadcast::Receiver<ApiEvent>) -> Vec<ApiEvent> {
    let mut out = Vec::new();
    loop {
      match rx.try_recv() {
        Ok(event) => out.push(event),
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
        Err(TryRecvError::Lagged(_)) => continue,
      }
    }
  }

  #[tokio::test]
  async fn sends_standard_headers() {
    let h = Harness::new();
    h.client
      .post(
        "/bookings",
        RequestOptions::new()
          .body(json!({"slot": 3}))
          .idempotency_key("booking-3"),
      )
      .await
      .unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert_eq!(sent.url, "http://tutor.test/api/bookings");
    assert_eq!(sent.headers["Content-Type"], "application/json");
    assert_eq!(sent.headers[RETRY_ATTEMPT_HEADER], "0");
    assert_eq!(sent.headers["X-Idempotency-Key"], "api:booking-3");
    assert_eq!(sent.headers[REQUEST_ID_HEADER].len(), 36);
    assert_eq!(sent.body, Some(json!({"slot": 3})));
  }

  #[tokio::test]
  async fn get_retries_once_on_recoverable_failure() {
    let h = Harness::new();
    h.transport.push(Scripted::status(503, ""));
    h.transport.push(Scripted::ok(json!({"ok": true})));

    let value = h.client.get("/courses", RequestOptions::new()).await.unwrap();
    assert_eq!(value, json!({"ok": true}));

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].headers[RETRY_ATTEMPT_HEADER], "1");
    assert_eq!(
      requests[0].headers[REQUEST_ID_HEADER],
      requests[1].headers[REQUEST_ID_HEADER]
    );
  }

  #[tokio::test]
  async fn retryable_status_outside_recoverable_codes_is_retried() {
    let h = Harness::new();
    h.transport.push(Scripted::status(408, "slow"));
    h.transport.push(Scripted::status(408, "slow"));

    let err = h.client.get("/courses", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.code, ApiErrorCode::Unknown);
    assert!(err.retryable);
    assert_eq!(h.transport.calls(), 2);
  }

  #[tokio::test]
  async fn mutations_are_not_retried_by_default() {
    let h = Harness::new();
    h.transport.push(Scripted::status(503, ""));

    let err = h.client.put("/profile", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.code, ApiErrorCode::ServerUnavailable);
    assert_eq!(h.transport.calls(), 1);
  }

  #[tokio::test]
  async fn not_found_is_surfaced_immediately() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    for _ in 0..6 {
      h.transport.push(Scripted::status(404, r#"{"error":"No such course"}"#));
    }

    for _ in 0..6 {
      let err = h.client.get("/courses/9", RequestOptions::new()).await.unwrap_err();
      assert_eq!(err.code, ApiErrorCode::NotFound);
      assert_eq!(err.message, "No such course");
      assert!(!err.retryable);
    }

    assert_eq!(h.transport.calls(), 6);
    assert_eq!(h.client.circuit().state(Method::Get, "/courses/9"), CircuitState::Closed);
    let failures = drain(&mut rx)
      .into_iter()
      .filter(|e| matches!(e, ApiEvent::Failure(_)))
      .count();
    assert_eq!(failures, 6);
  }

  #[tokio::test]
  async fn circuit_opens_and_short_circuits() {
    let h = Harness::with_settings(|s| s.retry.max_retries = 0);
    for _ in 0..4 {
      h.transport.push(Scripted::status(500, ""));
    }
    for _ in 0..4 {
      h.client.get("/tutors", RequestOptions::new()).await.unwrap_err();
    }
    assert_eq!(h.transport.calls(), 4);

    let err = h.client.get("/tutors", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.code, ApiErrorCode::CircuitOpen);
    assert!(err.retryable);
    assert_eq!(h.transport.calls(), 4);

    h.clock.advance(chrono::Duration::seconds(15));
    h.transport.push(Scripted::ok(json!([])));
    assert_eq!(
      h.client.get("/tutors", RequestOptions::new()).await.unwrap(),
      json!([])
    );
    assert_eq!(h.transport.calls(), 5);
  }

  #[tokio::test]
  async fn concurrent_gets_are_deduplicated() {
    let h = Harness::new();
    h.transport
      .push(Scripted::ok(json!({"n": 1})).delayed(Duration::from_millis(30)));

    let a = h.client.get("/courses", RequestOptions::new());
    let b = h.client.get("/courses", RequestOptions::new());
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap(), json!({"n": 1}));
    assert_eq!(b.unwrap(), json!({"n": 1}));
    assert_eq!(h.transport.calls(), 1);
  }

  #[tokio::test]
  async fn deduplicated_failures_reach_every_caller() {
    let h = Harness::with_settings(|s| s.retry.max_retries = 0);
    h.transport
      .push(Scripted::status(409, "taken").delayed(Duration::from_millis(30)));

    let (a, b) = tokio::join!(
      h.client.get("/slots", RequestOptions::new()),
      h.client.get("/slots", RequestOptions::new())
    );
    assert_eq!(a.unwrap_err(), b.unwrap_err());
    assert_eq!(h.transport.calls(), 1);
  }

  #[tokio::test]
  async fn different_headers_are_not_deduplicated() {
    let h = Harness::new();
    let a = h
      .client
      .get("/courses", RequestOptions::new().header("Accept-Language", "en"));
    let b = h
      .client
      .get("/courses", RequestOptions::new().header("Accept-Language", "de"));
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();
    assert_eq!(h.transport.calls(), 2);
  }

  #[tokio::test]
  async fn cached_get_skips_network_until_expiry() {
    let h = Harness::new();
    h.transport.push(Scripted::ok(json!("first")));
    h.transport.push(Scripted::ok(json!("second")));
    let opts = || RequestOptions::new().cache_ttl(Duration::from_millis(1000));

    assert_eq!(h.client.get("/catalog", opts()).await.unwrap(), json!("first"));
    h.clock.advance(chrono::Duration::milliseconds(500));
    assert_eq!(h.client.get("/catalog", opts()).await.unwrap(), json!("first"));
    assert_eq!(h.transport.calls(), 1);

    h.clock.advance(chrono::Duration::milliseconds(1000));
    assert_eq!(h.client.get("/catalog", opts()).await.unwrap(), json!("second"));
    assert_eq!(h.transport.calls(), 2);
  }

  #[tokio::test]
  async fn cached_without_ttl_uses_configured_default() {
    let h = Harness::new();
    h.transport.push(Scripted::ok(json!("first")));
    h.transport.push(Scripted::ok(json!("second")));

    h.client.get("/catalog", RequestOptions::new().cached()).await.unwrap();
    h.clock.advance(chrono::Duration::milliseconds(1000));
    assert_eq!(
      h.client.get("/catalog", RequestOptions::new().cached()).await.unwrap(),
      json!("first")
    );
    assert_eq!(h.transport.calls(), 1);

    h.clock.advance(chrono::Duration::milliseconds(600));
    assert_eq!(
      h.client.get("/catalog", RequestOptions::new().cached()).await.unwrap(),
      json!("second")
    );
    assert_eq!(h.transport.calls(), 2);
  }

  #[tokio::test]
  async fn stale_value_served_on_recoverable_failure() {
    let h = Harness::new();
    let opts = || {
      RequestOptions::new()
        .cache_ttl(Duration::from_millis(500))
        .stale_if_error(Duration::from_millis(5000))
    };
    h.transport.push(Scripted::ok(json!({"v": 1})));
    h.client.get("/schedule", opts()).await.unwrap();

    h.clock.advance(chrono::Duration::milliseconds(1000));
    h.transport.push(Scripted::fail("reset"));
    h.transport.push(Scripted::fail("reset"));
    assert_eq!(h.client.get("/schedule", opts()).await.unwrap(), json!({"v": 1}));
    assert_eq!(h.transport.calls(), 3);

    h.clock.advance(chrono::Duration::milliseconds(4000));
    h.transport.push(Scripted::fail("reset"));
    h.transport.push(Scripted::fail("reset"));
    let err = h.client.get("/schedule", opts()).await.unwrap_err();
    assert_eq!(err.code, ApiErrorCode::NetworkError);
  }

  #[tokio::test]
  async fn stale_value_not_served_for_non_recoverable_failure() {
    let h = Harness::new();
    let opts = || {
      RequestOptions::new()
        .cache_ttl(Duration::from_millis(500))
        .stale_if_error(Duration::from_millis(5000))
    };
    h.client.get("/schedule", opts()).await.unwrap();
    h.clock.advance(chrono::Duration::milliseconds(1000));
    h.transport.push(Scripted::status(403, ""));

    let err = h.client.get("/schedule", opts()).await.unwrap_err();
    assert_eq!(err.code, ApiErrorCode::Forbidden);
  }

  #[tokio::test]
  async fn successful_mutation_clears_cache_and_notifies() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    let opts = || RequestOptions::new().cache_ttl(Duration::from_secs(10));

    h.client.get("/bookings", opts()).await.unwrap();
    h.client.get("/bookings", opts()).await.unwrap();
    assert_eq!(h.transport.calls(), 1);

    h.client.post("/bookings", RequestOptions::new()).await.unwrap();
    assert!(h.client.cache().is_empty());

    h.client.get("/bookings", opts()).await.unwrap();
    assert_eq!(h.transport.calls(), 3);

    let changed = drain(&mut rx)
      .into_iter()
      .filter(|e| matches!(e, ApiEvent::DataChanged { .. }))
      .count();
    assert_eq!(changed, 1);
  }

  #[tokio::test]
  async fn data_change_notification_can_be_suppressed() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    h.client
      .del("/drafts/1", RequestOptions::new().notify_data_update(false))
      .await
      .unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ApiEvent::Success(_)));
  }

  #[tokio::test]
  async fn exactly_one_terminal_event_per_call() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    h.transport.push(Scripted::status(502, ""));
    h.transport.push(Scripted::status(502, ""));

    let err = h.client.get("/tutors", RequestOptions::new()).await.unwrap_err();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    let ApiEvent::Failure(failure) = &events[0] else {
      panic!("expected failure event, got {:?}", events[0]);
    };
    assert_eq!(failure.code, ApiErrorCode::ServerUnavailable);
    assert_eq!(failure.status, Some(502));
    assert_eq!(failure.request_id, err.request_id);
    assert!(failure.retryable);
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_stops_retry_loop() {
    let h = Harness::with_settings(|s| {
      s.retry.base_delay = Duration::from_secs(10);
      s.retry.max_delay = Duration::from_secs(10);
    });
    let mut rx = h.events.subscribe();
    h.transport.push(Scripted::status(503, ""));

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      cancel.cancel();
    });

    let err = h
      .client
      .get("/courses", RequestOptions::new().cancel(token))
      .await
      .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.transport.calls(), 1);
    assert!(drain(&mut rx).is_empty());
  }

  #[tokio::test]
  async fn typed_helpers_decode() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Course {
      id: u32,
      title: String,
    }

    let h = Harness::new();
    h.transport
      .push(Scripted::ok(json!({"id": 7, "title": "Algebra"})));
    let course: Course = h
      .client
      .get_json("/courses/7", RequestOptions::new())
      .await
      .unwrap();
    assert_eq!(
      course,
      Course {
        id: 7,
        title: "Algebra".into()
      }
    );

    h.transport.push(Scripted::ok(json!({"unexpected": true})));
    let err = h
      .client
      .send_json::<_, Course>(Method::Post, "/courses", &json!({}), RequestOptions::new())
      .await
      .unwrap_err();
    assert_eq!(err.code, ApiErrorCode::Unknown);
  }
}
