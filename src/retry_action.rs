//! Single-slot registry for the last user action that failed recoverably.
//!
//! The UI shows one retry button bound to whatever sits in the slot. A new
//! registration replaces the previous one.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use crate::api::ApiError;
use crate::clock::Clock;

/// Re-runnable action stored in the slot.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// What the UI sees of the stored action.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryableAction {
  pub id: String,
  pub title: String,
  pub created_at: DateTime<Utc>,
  pub pending: bool,
}

struct Slot {
  action: RetryableAction,
  run: RetryFn,
}

pub struct RetryLastActionRegistry {
  clock: Arc<dyn Clock>,
  slot: Mutex<Option<Slot>>,
  tx: watch::Sender<Option<RetryableAction>>,
}

impl RetryLastActionRegistry {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    let (tx, _rx) = watch::channel(None);
    Self {
      clock,
      slot: Mutex::new(None),
      tx,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn publish(&self, slot: &Option<Slot>) {
    self
      .tx
      .send_replace(slot.as_ref().map(|slot| slot.action.clone()));
  }

  /// Store `run` as the retryable action, replacing any previous one.
  pub fn set(&self, title: impl Into<String>, run: RetryFn) -> String {
    let action = RetryableAction {
      id: uuid::Uuid::new_v4().to_string(),
      title: title.into(),
      created_at: self.clock.now(),
      pending: false,
    };
    let id = action.id.clone();
    debug!(id = %id, title = %action.title, "Registered retryable action");

    let mut slot = self.lock();
    *slot = Some(Slot { action, run });
    self.publish(&slot);
    id
  }

  pub fn current(&self) -> Option<RetryableAction> {
    self.lock().as_ref().map(|slot| slot.action.clone())
  }

  pub fn clear(&self) {
    let mut slot = self.lock();
    *slot = None;
    self.publish(&slot);
  }

  /// Snapshot of the slot, updated on every change.
  pub fn subscribe(&self) -> watch::Receiver<Option<RetryableAction>> {
    self.tx.subscribe()
  }

  /// Run the stored action.
  ///
  /// Returns `None` when the slot is empty or its action is already running.
  /// Success empties the slot; failure leaves the action in place for
  /// another manual retry.
  pub async fn run(&self) -> Option<Result<Value, ApiError>> {
    let (claim, run) = {
      let mut slot = self.lock();
      let stored = slot.as_mut()?;
      if stored.action.pending {
        return None;
      }
      stored.action.pending = true;
      let claim = RunClaim {
        registry: self,
        id: stored.action.id.clone(),
      };
      let run = Arc::clone(&stored.run);
      self.publish(&slot);
      (claim, run)
    };

    let result = run().await;
    claim.settle(result.is_ok());
    Some(result)
  }
}

/// Marks the stored action as running. Dropping it without settling, e.g.
/// when the caller's future is cancelled, makes the action runnable again.
struct RunClaim<'a> {
  registry: &'a RetryLastActionRegistry,
  id: String,
}

impl RunClaim<'_> {
  fn settle(self, succeeded: bool) {
    if succeeded {
      let mut slot = self.registry.lock();
      if slot.as_ref().is_some_and(|stored| stored.action.id == self.id) {
        *slot = None;
        self.registry.publish(&slot);
      }
    }
    // Drop releases the pending flag on failure.
  }
}

impl Drop for RunClaim<'_> {
  fn drop(&mut self) {
    let mut slot = self.registry.lock();
    // Only touch the slot if it still holds this action.
    if let Some(stored) = slot.as_mut().filter(|stored| stored.action.id == self.id) {
      stored.action.pending = false;
      self.registry.publish(&slot);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiErrorCode;
  use crate::clock::ManualClock;
  use futures::FutureExt;
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn registry() -> RetryLastActionRegistry {
    RetryLastActionRegistry::new(Arc::new(ManualClock::default()))
  }

  /// Fails `failures` times, then succeeds.
  fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> RetryFn {
    Arc::new(move || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < failures {
          Err(ApiError::new(ApiErrorCode::NetworkError, "reset"))
        } else {
          Ok(json!({ "attempt": n }))
        }
      }
      .boxed()
    })
  }

  #[tokio::test]
  async fn failed_retry_keeps_slot_and_success_clears_it() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = registry.set("Book slot", flaky(1, calls.clone()));
    let mut rx = registry.subscribe();
    assert_eq!(rx.borrow_and_update().as_ref().map(|a| a.id.clone()), Some(id.clone()));

    let err = registry.run().await.unwrap().unwrap_err();
    assert_eq!(err.code, ApiErrorCode::NetworkError);
    let current = registry.current().unwrap();
    assert_eq!(current.id, id);
    assert!(!current.pending);

    let value = registry.run().await.unwrap().unwrap();
    assert_eq!(value, json!({ "attempt": 1 }));
    assert_eq!(registry.current(), None);
    assert_eq!(*rx.borrow_and_update(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn empty_slot_runs_nothing() {
    let registry = registry();
    assert!(registry.run().await.is_none());
  }

  #[tokio::test]
  async fn new_registration_replaces_previous() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.set("First", flaky(0, calls.clone()));
    let second = registry.set("Second", flaky(0, calls.clone()));
    assert_eq!(registry.current().unwrap().id, second);
    assert_eq!(registry.current().unwrap().title, "Second");

    registry.clear();
    assert_eq!(registry.current(), None);
  }

  #[tokio::test]
  async fn concurrent_runs_execute_once() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.set(
      "Slow",
      Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(std::time::Duration::from_millis(20)).await;
          Ok(Value::Null)
        }
        .boxed()
      }),
    );

    let (a, b) = tokio::join!(registry.run(), registry.run());
    assert_eq!([a.is_some(), b.is_some()].iter().filter(|ran| **ran).count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn replacement_during_run_is_preserved() {
    let registry = Arc::new(registry());
    let calls = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&registry);
    let counter = calls.clone();
    registry.set(
      "Outer",
      Arc::new(move || {
        let replacement = flaky(0, counter.clone());
        inner.set("Replacement", replacement);
        async { Ok(Value::Null) }.boxed()
      }),
    );

    registry.run().await.unwrap().unwrap();
    assert_eq!(registry.current().unwrap().title, "Replacement");
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_run_releases_the_slot() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.set(
      "Slow",
      Arc::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
          }
          Ok(json!({ "attempt": n }))
        }
        .boxed()
      }),
    );

    let cancelled =
      tokio::time::timeout(std::time::Duration::from_millis(10), registry.run()).await;
    assert!(cancelled.is_err());
    assert!(!registry.current().unwrap().pending);
    assert!(!registry.subscribe().borrow().as_ref().unwrap().pending);

    let value = registry.run().await.unwrap().unwrap();
    assert_eq!(value, json!({ "attempt": 1 }));
    assert_eq!(registry.current(), None);
  }
}
