//! Error taxonomy for API calls and the recoverability rules built on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure reason for an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
  NetworkOffline,
  NetworkError,
  Timeout,
  ServerUnavailable,
  CircuitOpen,
  RateLimited,
  Conflict,
  Validation,
  Unauthorized,
  Forbidden,
  NotFound,
  Unknown,
  /// The caller cancelled the request.
  Cancelled,
}

impl ApiErrorCode {
  /// Codes that indicate a transient condition worth retrying, queueing or
  /// counting against an endpoint's circuit.
  pub const RECOVERABLE: [ApiErrorCode; 6] = [
    ApiErrorCode::NetworkOffline,
    ApiErrorCode::NetworkError,
    ApiErrorCode::Timeout,
    ApiErrorCode::ServerUnavailable,
    ApiErrorCode::CircuitOpen,
    ApiErrorCode::RateLimited,
  ];

  pub fn is_recoverable(self) -> bool {
    Self::RECOVERABLE.contains(&self)
  }

  /// Classify a non-2xx HTTP status.
  pub fn from_status(status: u16) -> Self {
    match status {
      400 | 422 => Self::Validation,
      401 => Self::Unauthorized,
      403 => Self::Forbidden,
      404 => Self::NotFound,
      409 => Self::Conflict,
      429 => Self::RateLimited,
      s if s >= 500 => Self::ServerUnavailable,
      _ => Self::Unknown,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::NetworkOffline => "network_offline",
      Self::NetworkError => "network_error",
      Self::Timeout => "timeout",
      Self::ServerUnavailable => "server_unavailable",
      Self::CircuitOpen => "circuit_open",
      Self::RateLimited => "rate_limited",
      Self::Conflict => "conflict",
      Self::Validation => "validation",
      Self::Unauthorized => "unauthorized",
      Self::Forbidden => "forbidden",
      Self::NotFound => "not_found",
      Self::Unknown => "unknown",
      Self::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for ApiErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A failed API call.
///
/// Cloneable so every caller sharing a deduplicated request observes the
/// same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
  pub code: ApiErrorCode,
  pub status: Option<u16>,
  pub message: String,
  pub request_id: Option<String>,
  /// Explicitly marked retryable by the orchestrator, independent of `code`.
  pub retryable: bool,
}

impl ApiError {
  pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      status: None,
      message: message.into(),
      request_id: None,
      retryable: code.is_recoverable(),
    }
  }

  pub fn http(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      ..Self::new(ApiErrorCode::from_status(status), message)
    }
  }

  pub fn cancelled() -> Self {
    Self::new(ApiErrorCode::Cancelled, "Request was cancelled")
  }

  pub fn circuit_open(method: &str, path: &str) -> Self {
    Self::new(
      ApiErrorCode::CircuitOpen,
      format!("Circuit open for {} {}", method, path),
    )
  }

  pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
    self.request_id = Some(request_id.into());
    self
  }

  pub fn with_retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self
  }

  /// Whether the failure is transient: explicitly flagged retryable, or
  /// carrying one of the recoverable codes.
  pub fn is_recoverable(&self) -> bool {
    self.code != ApiErrorCode::Cancelled && (self.retryable || self.code.is_recoverable())
  }

  pub fn is_cancelled(&self) -> bool {
    self.code == ApiErrorCode::Cancelled
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_classification() {
    let cases = [
      (400, ApiErrorCode::Validation),
      (422, ApiErrorCode::Validation),
      (401, ApiErrorCode::Unauthorized),
      (403, ApiErrorCode::Forbidden),
      (404, ApiErrorCode::NotFound),
      (409, ApiErrorCode::Conflict),
      (429, ApiErrorCode::RateLimited),
      (500, ApiErrorCode::ServerUnavailable),
      (503, ApiErrorCode::ServerUnavailable),
      (408, ApiErrorCode::Unknown),
      (418, ApiErrorCode::Unknown),
    ];
    for (status, code) in cases {
      assert_eq!(ApiErrorCode::from_status(status), code, "status {status}");
    }
  }

  #[test]
  fn recoverability_follows_code_or_flag() {
    assert!(ApiError::http(503, "down").is_recoverable());
    assert!(!ApiError::http(404, "missing").is_recoverable());
    assert!(ApiError::http(408, "slow")
      .with_retryable(true)
      .is_recoverable());
    assert!(!ApiError::cancelled().with_retryable(true).is_recoverable());
  }

  #[test]
  fn code_serializes_snake_case() {
    let json = serde_json::to_string(&ApiErrorCode::ServerUnavailable).unwrap();
    assert_eq!(json, "\"server_unavailable\"");
    assert_eq!(ApiErrorCode::CircuitOpen.to_string(), "circuit_open");
  }
}
