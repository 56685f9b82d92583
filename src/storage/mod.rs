//! Durable key-value storage for client state that must survive restarts.
//!
//! Values are strings; [`write_json`] and [`read_json`] add a JSON envelope
//! with an optional expiry on top of any [`KvStore`].

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::clock::span;

/// Trait for key-value storage backends.
pub trait KvStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
  value: T,
  expires_at: Option<DateTime<Utc>>,
}

/// Store `value` under `key`, expiring `ttl` after `now`.
pub fn write_json<T: Serialize>(
  store: &dyn KvStore,
  key: &str,
  value: &T,
  ttl: Option<Duration>,
  now: DateTime<Utc>,
) -> Result<()> {
  let envelope = Envelope {
    value,
    expires_at: ttl.map(|ttl| now + span(ttl)),
  };
  let json = serde_json::to_string(&envelope)
    .map_err(|e| eyre!("Failed to serialize value for {}: {}", key, e))?;
  store.set(key, &json)
}

/// Load the value under `key`. Expired or unreadable envelopes are deleted
/// and reported as absent.
pub fn read_json<T: DeserializeOwned>(
  store: &dyn KvStore,
  key: &str,
  now: DateTime<Utc>,
) -> Result<Option<T>> {
  let Some(raw) = store.get(key)? else {
    return Ok(None);
  };

  match serde_json::from_str::<Envelope<T>>(&raw) {
    Ok(envelope) if envelope.expires_at.is_some_and(|at| at <= now) => {
      store.remove(key)?;
      Ok(None)
    }
    Ok(envelope) => Ok(Some(envelope.value)),
    Err(e) => {
      tracing::warn!(key, error = %e, "Discarding unreadable stored value");
      store.remove(key)?;
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn envelope_round_trip_and_expiry() {
    let store = MemoryKvStore::new();
    let now = Utc::now();
    write_json(&store, "k", &vec![1, 2, 3], Some(Duration::from_secs(60)), now).unwrap();

    let raw = store.get("k").unwrap().unwrap();
    assert!(raw.contains("\"expiresAt\""));

    let value: Option<Vec<u32>> = read_json(&store, "k", now + chrono::Duration::seconds(59)).unwrap();
    assert_eq!(value, Some(vec![1, 2, 3]));

    let value: Option<Vec<u32>> = read_json(&store, "k", now + chrono::Duration::seconds(60)).unwrap();
    assert_eq!(value, None);
    assert_eq!(store.get("k").unwrap(), None);
  }

  #[test]
  fn corrupt_values_are_dropped() {
    let store = MemoryKvStore::new();
    store.set("k", "not json").unwrap();
    let value: Option<Vec<u32>> = read_json(&store, "k", Utc::now()).unwrap();
    assert_eq!(value, None);
    assert_eq!(store.get("k").unwrap(), None);
  }

  #[test]
  fn no_ttl_never_expires() {
    let store = MemoryKvStore::new();
    let now = Utc::now();
    write_json(&store, "k", &"v", None, now).unwrap();
    let value: Option<String> = read_json(&store, "k", now + chrono::Duration::days(3650)).unwrap();
    assert_eq!(value.as_deref(), Some("v"));
  }
}
