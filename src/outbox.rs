//! Durable outbox for mutations that failed on a transient error.
//!
//! Entries replay strictly in insertion order, one flush at a time. A
//! transient failure stops the flush and schedules the next attempt with
//! backoff; a permanent failure drops only that entry. Entries older than
//! the maximum age are discarded without ever being sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, ApiErrorCode, Method, RequestOptions};
use crate::backoff::BackoffPolicy;
use crate::clock::{span, Clock};
use crate::signals::HostSignals;
use crate::single_flight::SingleFlight;
use crate::storage::{read_json, write_json, KvStore};

/// Idempotency prefix for replayed entries; the key is the entry id.
const REPLAY_KEY_PREFIX: &str = "outbox";

/// A queued mutation as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
  pub id: String,
  pub title: String,
  pub method: Method,
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers: Option<BTreeMap<String, String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notify_data_update: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dedupe_key: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A mutation to send or queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
  pub title: String,
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  pub headers: Option<BTreeMap<String, String>>,
  pub notify_data_update: Option<bool>,
  pub dedupe_key: Option<String>,
}

impl NewOutboxEntry {
  pub fn new(title: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      method,
      path: path.into(),
      body: None,
      headers: None,
      notify_data_update: None,
      dedupe_key: None,
    }
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self
      .headers
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), value.into());
    self
  }

  pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
    self.dedupe_key = Some(key.into());
    self
  }

  pub fn notify_data_update(mut self, notify: bool) -> Self {
    self.notify_data_update = Some(notify);
    self
  }

  /// Only mutations are queued.
  fn check_method(&self) -> Result<(), ApiError> {
    if self.method.is_mutation() {
      Ok(())
    } else {
      Err(ApiError::new(
        ApiErrorCode::Validation,
        format!("{} {} cannot be queued", self.method, self.path),
      ))
    }
  }

  fn options(&self) -> RequestOptions {
    RequestOptions {
      headers: self.headers.clone().unwrap_or_default(),
      body: self.body.clone(),
      notify_data_update: self.notify_data_update,
      ..RequestOptions::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxSettings {
  pub storage_key: String,
  pub max_age: Duration,
  pub backoff: BackoffPolicy,
}

impl Default for OutboxSettings {
  fn default() -> Self {
    Self {
      storage_key: "tutorlink.outbox.v1".to_string(),
      max_age: Duration::from_secs(7 * 24 * 60 * 60),
      backoff: BackoffPolicy::new(Duration::from_millis(1500), Duration::from_secs(60))
        .with_jitter(0.15, 0.40),
    }
  }
}

/// Result of [`OutboxQueue::send_or_enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
  Delivered(Value),
  /// Queued for replay under this entry id
  Queued(String),
}

/// Why a flush did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSkip {
  AlreadyFlushing,
  Offline,
  BackingOff { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
  pub delivered: usize,
  pub dropped: usize,
  pub remaining: usize,
  /// Stopped on a transient failure; the next attempt is scheduled.
  pub deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
  Skipped(FlushSkip),
  Completed(FlushSummary),
}

#[derive(Debug, Default)]
struct OutboxState {
  entries: Vec<OutboxEntry>,
  failure_count: u32,
  next_retry_at: Option<DateTime<Utc>>,
}

pub struct OutboxQueue {
  client: ApiClient,
  store: Arc<dyn KvStore>,
  settings: OutboxSettings,
  clock: Arc<dyn Clock>,
  signals: Arc<HostSignals>,
  state: Mutex<OutboxState>,
  flight: SingleFlight,
  len_tx: watch::Sender<usize>,
}

impl OutboxQueue {
  /// Restore the queue from `store`, dropping entries past the maximum age.
  pub fn load(
    client: ApiClient,
    store: Arc<dyn KvStore>,
    settings: OutboxSettings,
    signals: Arc<HostSignals>,
  ) -> Self {
    let clock = client.clock();
    let now = clock.now();
    let entries = match read_json::<Vec<OutboxEntry>>(store.as_ref(), &settings.storage_key, now) {
      Ok(entries) => entries.unwrap_or_default(),
      Err(e) => {
        warn!(error = %e, "Failed to load outbox, starting empty");
        Vec::new()
      }
    };

    let (len_tx, _rx) = watch::channel(entries.len());
    let queue = Self {
      client,
      store,
      settings,
      clock,
      signals,
      state: Mutex::new(OutboxState {
        entries,
        ..OutboxState::default()
      }),
      flight: SingleFlight::new(),
      len_tx,
    };

    let mut state = queue.lock();
    if queue.prune(&mut state, now) > 0 {
      queue.persist(&state, now);
    }
    drop(state);
    queue
  }

  fn lock(&self) -> MutexGuard<'_, OutboxState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Drop expired entries. Returns how many were dropped.
  fn prune(&self, state: &mut OutboxState, now: DateTime<Utc>) -> usize {
    let cutoff = now - span(self.settings.max_age);
    let before = state.entries.len();
    state.entries.retain(|entry| entry.updated_at.max(entry.created_at) > cutoff);
    let dropped = before - state.entries.len();
    if dropped > 0 {
      info!(dropped, "Discarded expired outbox entries");
    }
    dropped
  }

  fn persist(&self, state: &OutboxState, now: DateTime<Utc>) {
    let result = write_json(
      self.store.as_ref(),
      &self.settings.storage_key,
      &state.entries,
      Some(self.settings.max_age),
      now,
    );
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist outbox");
    }
    self.len_tx.send_replace(state.entries.len());
  }

  pub fn entries(&self) -> Vec<OutboxEntry> {
    self.lock().entries.clone()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Queue length, updated after every change.
  pub fn subscribe_len(&self) -> watch::Receiver<usize> {
    self.len_tx.subscribe()
  }

  pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
    self.lock().next_retry_at
  }

  /// Queue a mutation and, when the link is up, start a flush in the
  /// background. Returns the entry id.
  ///
  /// An entry sharing `dedupe_key` with a queued one replaces its content
  /// in place and keeps its id and position.
  pub fn enqueue(self: &Arc<Self>, entry: NewOutboxEntry) -> Result<String, ApiError> {
    entry.check_method()?;
    let id = self.insert(entry, None);
    self.kick();
    Ok(id)
  }

  fn insert(&self, entry: NewOutboxEntry, id: Option<String>) -> String {
    let now = self.clock.now();
    let mut state = self.lock();
    self.prune(&mut state, now);

    let existing = entry.dedupe_key.as_ref().and_then(|key| {
      state
        .entries
        .iter_mut()
        .find(|queued| queued.dedupe_key.as_ref() == Some(key))
    });

    let id = match existing {
      Some(queued) => {
        queued.title = entry.title;
        queued.method = entry.method;
        queued.path = entry.path;
        queued.body = entry.body;
        queued.headers = entry.headers;
        queued.notify_data_update = entry.notify_data_update;
        queued.updated_at = now;
        debug!(id = %queued.id, "Replaced queued outbox entry");
        queued.id.clone()
      }
      None => {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        state.entries.push(OutboxEntry {
          id: id.clone(),
          title: entry.title,
          method: entry.method,
          path: entry.path,
          body: entry.body,
          headers: entry.headers,
          notify_data_update: entry.notify_data_update,
          dedupe_key: entry.dedupe_key,
          created_at: now,
          updated_at: now,
        });
        debug!(id = %id, "Queued outbox entry");
        id
      }
    };

    self.persist(&state, now);
    id
  }

  fn kick(self: &Arc<Self>) {
    if !self.signals.is_link_online() {
      return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let queue = Arc::clone(self);
      handle.spawn(async move {
        queue.flush().await;
      });
    }
  }

  /// Send the mutation now; queue it if it fails transiently.
  ///
  /// The first attempt and every replay share one idempotency key, so the
  /// server can discard a replay of a write that did land.
  pub async fn send_or_enqueue(
    self: &Arc<Self>,
    entry: NewOutboxEntry,
  ) -> Result<SendOutcome, ApiError> {
    entry.check_method()?;
    let id = uuid::Uuid::new_v4().to_string();
    let options = entry
      .options()
      .idempotency_key(id.clone())
      .idempotency_prefix(REPLAY_KEY_PREFIX);

    match self.client.request(entry.method, &entry.path, options).await {
      Ok(value) => Ok(SendOutcome::Delivered(value)),
      Err(err) if err.is_recoverable() => {
        warn!(path = %entry.path, code = %err.code, "Mutation failed, queued for replay");
        let id = self.insert(entry, Some(id));
        Ok(SendOutcome::Queued(id))
      }
      Err(err) => Err(err),
    }
  }

  pub fn remove(&self, id: &str) -> bool {
    let now = self.clock.now();
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|entry| entry.id != id);
    let removed = state.entries.len() != before;
    self.prune(&mut state, now);
    self.persist(&state, now);
    removed
  }

  pub fn clear(&self) {
    let now = self.clock.now();
    let mut state = self.lock();
    state.entries.clear();
    state.failure_count = 0;
    state.next_retry_at = None;
    self.persist(&state, now);
  }

  /// Replay queued entries in order.
  pub async fn flush(&self) -> FlushOutcome {
    let Some(_permit) = self.flight.try_begin() else {
      return FlushOutcome::Skipped(FlushSkip::AlreadyFlushing);
    };
    if !self.signals.is_link_online() {
      return FlushOutcome::Skipped(FlushSkip::Offline);
    }
    {
      let now = self.clock.now();
      let mut state = self.lock();
      if let Some(until) = state.next_retry_at.filter(|until| *until > now) {
        return FlushOutcome::Skipped(FlushSkip::BackingOff { until });
      }
      if self.prune(&mut state, now) > 0 {
        self.persist(&state, now);
      }
    }

    let mut summary = FlushSummary::default();
    loop {
      let Some(entry) = self.lock().entries.first().cloned() else {
        break;
      };

      match self.replay(&entry).await {
        Ok(_) => {
          let now = self.clock.now();
          let mut state = self.lock();
          // An entry replaced while in flight still has unsent content.
          state
            .entries
            .retain(|queued| queued.id != entry.id || queued.updated_at != entry.updated_at);
          state.failure_count = 0;
          state.next_retry_at = None;
          self.prune(&mut state, now);
          self.persist(&state, now);
          summary.delivered += 1;
          info!(id = %entry.id, title = %entry.title, "Replayed outbox entry");
        }
        Err(err) if err.is_recoverable() => {
          let now = self.clock.now();
          let mut state = self.lock();
          state.failure_count += 1;
          let delay = self.settings.backoff.delay(state.failure_count);
          let until = now + span(delay);
          state.next_retry_at = Some(until);
          summary.deferred = true;
          warn!(
            id = %entry.id,
            code = %err.code,
            failures = state.failure_count,
            %until,
            "Outbox replay failed, backing off"
          );
          break;
        }
        Err(err) => {
          let now = self.clock.now();
          let mut state = self.lock();
          state
            .entries
            .retain(|queued| queued.id != entry.id || queued.updated_at != entry.updated_at);
          self.prune(&mut state, now);
          self.persist(&state, now);
          summary.dropped += 1;
          warn!(id = %entry.id, code = %err.code, error = %err, "Dropped outbox entry");
        }
      }
    }

    summary.remaining = self.len();
    FlushOutcome::Completed(summary)
  }

  async fn replay(&self, entry: &OutboxEntry) -> Result<Value, ApiError> {
    let options = RequestOptions {
      headers: entry.headers.clone().unwrap_or_default(),
      body: entry.body.clone(),
      retry: Some(false),
      idempotency_key: Some(entry.id.clone()),
      idempotency_prefix: Some(REPLAY_KEY_PREFIX.to_string()),
      notify_data_update: entry.notify_data_update,
      ..RequestOptions::default()
    };
    self.client.request(entry.method, &entry.path, options).await
  }
}
