//! Single HTTP exchange with timeout, cancellation and outcome classification.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::{ApiError, ApiErrorCode};
use super::request::Method;
use super::transport::{HttpTransport, TransportRequest, TransportResponse};
use crate::signals::HostSignals;

/// Lower bound applied to every timeout budget.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(12_000);

/// One request as handed to the executor. Headers are final.
#[derive(Debug, Clone)]
pub struct Exchange {
  pub method: Method,
  pub path: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
  pub timeout: Option<Duration>,
  pub cancel: Option<CancellationToken>,
}

impl Exchange {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      headers: BTreeMap::new(),
      body: None,
      timeout: None,
      cancel: None,
    }
  }
}

/// Performs exactly one exchange against the configured API root.
#[derive(Clone)]
pub struct RequestExecutor {
  transport: Arc<dyn HttpTransport>,
  /// `base_url` joined with `base_path`, no trailing slash.
  root: String,
  default_timeout: Duration,
  signals: Arc<HostSignals>,
}

impl RequestExecutor {
  pub fn new(
    transport: Arc<dyn HttpTransport>,
    base_url: &str,
    base_path: &str,
    signals: Arc<HostSignals>,
  ) -> Self {
    let root = format!(
      "{}/{}",
      base_url.trim_end_matches('/'),
      base_path.trim_matches('/')
    );
    Self {
      transport,
      root: root.trim_end_matches('/').to_string(),
      default_timeout: DEFAULT_TIMEOUT,
      signals,
    }
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout.max(MIN_TIMEOUT);
    self
  }

  pub fn signals(&self) -> &Arc<HostSignals> {
    &self.signals
  }

  pub fn url_for(&self, path: &str) -> String {
    format!("{}/{}", self.root, path.trim_start_matches('/'))
  }

  fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
    requested.unwrap_or(self.default_timeout).max(MIN_TIMEOUT)
  }

  /// Run the exchange. Returns the parsed body on 2xx.
  pub async fn execute(&self, exchange: Exchange) -> Result<Value, ApiError> {
    let timeout = self.effective_timeout(exchange.timeout);
    let cancel = exchange.cancel.unwrap_or_default();
    let request = TransportRequest {
      method: exchange.method,
      url: self.url_for(&exchange.path),
      headers: exchange.headers,
      body: exchange.body,
    };

    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(ApiError::cancelled()),
      _ = tokio::time::sleep(timeout) => {
        return Err(ApiError::new(
          ApiErrorCode::Timeout,
          format!("Request timed out after {}ms", timeout.as_millis()),
        ));
      }
      result = self.transport.send(request) => result,
    };

    match outcome {
      Ok(response) if response.is_success() => Ok(parse_body(&response.body)),
      Ok(response) => Err(ApiError::http(response.status, error_message(&response))),
      Err(failure) => {
        let code = if self.signals.is_link_online() {
          ApiErrorCode::NetworkError
        } else {
          ApiErrorCode::NetworkOffline
        };
        Err(ApiError::new(code, failure.0))
      }
    }
  }
}

/// JSON when the body parses, the raw text otherwise, `null` when empty.
pub fn parse_body(body: &str) -> Value {
  if body.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Message for a failed response: `{"error": "..."}`, a plain string body,
/// or the status reason phrase.
fn error_message(response: &TransportResponse) -> String {
  let fallback = || {
    if response.reason.is_empty() {
      format!("HTTP {}", response.status)
    } else {
      response.reason.clone()
    }
  };

  match parse_body(&response.body) {
    Value::Object(map) => match map.get("error") {
      Some(Value::String(message)) if !message.trim().is_empty() => message.clone(),
      _ => fallback(),
    },
    Value::String(message) if !message.trim().is_empty() => message,
    _ => fallback(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{Scripted, ScriptedTransport};
  use serde_json::json;

  fn executor(transport: &Arc<ScriptedTransport>) -> RequestExecutor {
    RequestExecutor::new(
      transport.clone(),
      "https://tutor.test",
      "/api",
      Arc::new(HostSignals::new()),
    )
  }

  #[test]
  fn joins_root_and_path() {
    let transport = Arc::new(ScriptedTransport::new());
    let exec = executor(&transport);
    assert_eq!(exec.url_for("/courses"), "https://tutor.test/api/courses");
    assert_eq!(exec.url_for("courses/1"), "https://tutor.test/api/courses/1");
  }

  #[test]
  fn body_parsing() {
    assert_eq!(parse_body(""), Value::Null);
    assert_eq!(parse_body("{\"a\":1}"), json!({"a": 1}));
    assert_eq!(parse_body("plain"), json!("plain"));
  }

  #[tokio::test]
  async fn classifies_http_failures_with_body_message() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Scripted::status(422, r#"{"error":"Email is required"}"#));
    transport.push(Scripted::status(503, ""));
    let exec = executor(&transport);

    let err = exec
      .execute(Exchange::new(Method::Post, "/bookings"))
      .await
      .unwrap_err();
    assert_eq!(err.code, ApiErrorCode::Validation);
    assert_eq!(err.status, Some(422));
    assert_eq!(err.message, "Email is required");

    let err = exec
      .execute(Exchange::new(Method::Get, "/courses"))
      .await
      .unwrap_err();
    assert_eq!(err.code, ApiErrorCode::ServerUnavailable);
    assert_eq!(err.message, "Service Unavailable");
  }

  #[tokio::test]
  async fn transport_failure_depends_on_link_state() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Scripted::fail("connection reset"));
    transport.push(Scripted::fail("no route"));
    let exec = executor(&transport);

    let err = exec
      .execute(Exchange::new(Method::Get, "/courses"))
      .await
      .unwrap_err();
    assert_eq!(err.code, ApiErrorCode::NetworkError);

    exec.signals().set_link_online(false);
    let err = exec
      .execute(Exchange::new(Method::Get, "/courses"))
      .await
      .unwrap_err();
    assert_eq!(err.code, ApiErrorCode::NetworkOffline);
  }

  #[tokio::test(start_paused = true)]
  async fn timeout_is_clamped_and_classified() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Scripted::ok(json!({})).delayed(Duration::from_secs(5)));
    let exec = executor(&transport);

    let mut exchange = Exchange::new(Method::Get, "/slow");
    exchange.timeout = Some(Duration::from_millis(10));
    let started = tokio::time::Instant::now();
    let err = exec.execute(exchange).await.unwrap_err();

    assert_eq!(err.code, ApiErrorCode::Timeout);
    assert!(started.elapsed() >= MIN_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[tokio::test(start_paused = true)]
  async fn caller_cancellation_is_not_a_timeout() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Scripted::ok(json!({})).delayed(Duration::from_secs(5)));
    let exec = executor(&transport);

    let token = CancellationToken::new();
    let mut exchange = Exchange::new(Method::Get, "/slow");
    exchange.cancel = Some(token.clone());
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      token.cancel();
    });

    let err = exec.execute(exchange).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(!err.is_recoverable());
  }
}
