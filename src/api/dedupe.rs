//! Coalesces concurrent identical GETs into one shared future.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use super::error::ApiError;

type SharedCall = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

#[derive(Clone, Default)]
pub struct InflightDeduplicator {
  inflight: Arc<Mutex<HashMap<String, SharedCall>>>,
}

impl InflightDeduplicator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Join the in-flight call for `key`, or start one with `start`.
  ///
  /// The entry leaves the map as soon as the call settles, so the next
  /// call after that starts fresh.
  pub async fn run<F, Fut>(&self, key: String, start: F) -> Result<Value, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
  {
    let call = {
      let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
      match inflight.get(&key) {
        Some(existing) => {
          tracing::debug!(key = %key, "Joining in-flight request");
          existing.clone()
        }
        None => {
          let registry = Arc::clone(&self.inflight);
          let settle_key = key.clone();
          let fut = start();
          let call = async move {
            let result = fut.await;
            registry
              .lock()
              .unwrap_or_else(PoisonError::into_inner)
              .remove(&settle_key);
            result
          }
          .boxed()
          .shared();
          inflight.insert(key, call.clone());
          call
        }
      }
    };
    call.await
  }

  pub fn len(&self) -> usize {
    self
      .inflight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn concurrent_callers_share_one_call() {
    let dedupe = InflightDeduplicator::new();
    let started = Arc::new(AtomicUsize::new(0));

    let call = |started: Arc<AtomicUsize>| {
      let dedupe = dedupe.clone();
      async move {
        dedupe
          .run("GET:/courses:".to_string(), move || {
            started.fetch_add(1, Ordering::SeqCst);
            async {
              tokio::time::sleep(Duration::from_millis(20)).await;
              Err(ApiError::http(503, "down"))
            }
          })
          .await
      }
    };

    let (a, b) = tokio::join!(call(started.clone()), call(started.clone()));
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(a, b);
    assert!(dedupe.is_empty());
  }

  #[tokio::test]
  async fn settled_entries_are_not_reused() {
    let dedupe = InflightDeduplicator::new();
    let first = dedupe
      .run("k".to_string(), || async { Ok(json!(1)) })
      .await
      .unwrap();
    let second = dedupe
      .run("k".to_string(), || async { Ok(json!(2)) })
      .await
      .unwrap();
    assert_eq!((first, second), (json!(1), json!(2)));
  }
}
