//! Keyed locks for user-triggered mutations.
//!
//! A second action under a held key is rejected instead of queued. The key
//! is freed when the action settles, or when it outlives the timeout; in
//! that case the action keeps running but no longer blocks new attempts.
//! Recoverable failures land in the [`RetryLastActionRegistry`].

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::{ApiError, ApiErrorCode};
use crate::clock::Clock;
use crate::event::{ActionGuardEvent, ApiEvent, ApiEvents, GuardStatus};
use crate::retry_action::RetryLastActionRegistry;

pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
  #[error("action '{0}' is already in progress")]
  Blocked(String),
  #[error(transparent)]
  Api(#[from] ApiError),
}

/// Set of held lock keys.
#[derive(Debug, Clone, Default)]
struct KeyedLocks {
  held: Arc<Mutex<HashSet<String>>>,
}

impl KeyedLocks {
  fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
    self.held.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn try_acquire(&self, key: &str) -> Option<KeyLease> {
    self.lock().insert(key.to_string()).then(|| KeyLease {
      locks: self.clone(),
      key: key.to_string(),
    })
  }

  fn is_held(&self, key: &str) -> bool {
    self.lock().contains(key)
  }
}

/// Frees its key when dropped.
struct KeyLease {
  locks: KeyedLocks,
  key: String,
}

impl Drop for KeyLease {
  fn drop(&mut self) {
    self.locks.lock().remove(&self.key);
  }
}

pub struct ActionGuard {
  locks: KeyedLocks,
  timeout: Duration,
  registry: Arc<RetryLastActionRegistry>,
  events: ApiEvents,
  clock: Arc<dyn Clock>,
}

impl ActionGuard {
  pub fn new(
    registry: Arc<RetryLastActionRegistry>,
    events: ApiEvents,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      locks: KeyedLocks::default(),
      timeout: DEFAULT_GUARD_TIMEOUT,
      registry,
      events,
      clock,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn is_locked(&self, lock_key: &str) -> bool {
    self.locks.is_held(lock_key)
  }

  fn emit(&self, status: GuardStatus, lock_key: &str) {
    self.events.emit(ApiEvent::ActionGuard(ActionGuardEvent {
      status,
      lock_key: lock_key.to_string(),
      timestamp: self.clock.now(),
    }));
  }

  /// Run `action` while holding `lock_key`.
  ///
  /// `action` is kept so a recoverable failure can be retried from the
  /// registry under the same key.
  pub async fn run<F, Fut>(
    &self,
    lock_key: &str,
    title: &str,
    action: F,
  ) -> Result<Value, GuardError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
  {
    let Some(lease) = self.locks.try_acquire(lock_key) else {
      debug!(lock_key, "Action blocked by a running one");
      self.emit(GuardStatus::Blocked, lock_key);
      return Err(GuardError::Blocked(lock_key.to_string()));
    };
    self.emit(GuardStatus::Started, lock_key);

    let mut lease = Some(lease);
    let pending = action();
    tokio::pin!(pending);
    let settled = tokio::time::timeout(self.timeout, &mut pending).await;
    let result = match settled {
      Ok(result) => result,
      Err(_) => {
        lease.take();
        warn!(lock_key, timeout_ms = self.timeout.as_millis() as u64, "Action outlived its lock");
        self.emit(GuardStatus::ReleasedOnTimeout, lock_key);
        pending.await
      }
    };
    drop(lease);

    match result {
      Ok(value) => {
        self.emit(GuardStatus::Succeeded, lock_key);
        Ok(value)
      }
      Err(err) => {
        self.emit(GuardStatus::Failed, lock_key);
        if err.is_recoverable() {
          self.register_retry(lock_key, title, action);
        }
        Err(err.into())
      }
    }
  }

  fn register_retry<F, Fut>(&self, lock_key: &str, title: &str, action: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
  {
    let locks = self.locks.clone();
    let key = lock_key.to_string();
    self.registry.set(
      title,
      Arc::new(move || {
        let lease = locks.try_acquire(&key);
        let pending = lease.as_ref().map(|_| action());
        let key = key.clone();
        async move {
          let (Some(_lease), Some(pending)) = (lease, pending) else {
            return Err(ApiError::new(
              ApiErrorCode::Conflict,
              format!("action '{}' is already in progress", key),
            ));
          };
          pending.await
        }
        .boxed()
      }),
    );
  }
}
