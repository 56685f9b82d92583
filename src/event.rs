use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::api::{ApiErrorCode, Method};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// A request settled successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSuccess {
  pub path: String,
  pub method: Method,
  pub timestamp: DateTime<Utc>,
}

/// A request settled with an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFailure {
  pub code: ApiErrorCode,
  pub status: Option<u16>,
  pub request_id: Option<String>,
  pub retryable: bool,
  pub path: String,
  pub method: Method,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
  Started,
  Succeeded,
  Failed,
  /// Another action already holds the lock key
  Blocked,
  /// The lock was released while the action was still running
  ReleasedOnTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGuardEvent {
  pub status: GuardStatus,
  pub lock_key: String,
  pub timestamp: DateTime<Utc>,
}

/// Application events
#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
  Success(ApiSuccess),
  Failure(ApiFailure),
  /// A mutation succeeded; data loaders should refresh
  DataChanged {
    path: String,
    method: Method,
    timestamp: DateTime<Utc>,
  },
  ActionGuard(ActionGuardEvent),
}

/// Process-wide event bus. Clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct ApiEvents {
  tx: broadcast::Sender<ApiEvent>,
}

impl ApiEvents {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
    self.tx.subscribe()
  }

  /// Publish to current subscribers. Events with no subscriber are dropped.
  pub fn emit(&self, event: ApiEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for ApiEvents {
  fn default() -> Self {
    Self::new()
  }
}
