//! In-memory GET response cache with a stale-if-error window.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{span, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
  /// TTL used by callers that opt into caching without choosing one.
  pub default_ttl: Duration,
  pub max_ttl: Duration,
  pub max_stale: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      default_ttl: Duration::from_millis(1500),
      max_ttl: Duration::from_millis(20_000),
      max_stale: Duration::from_secs(300),
    }
  }
}

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Within its TTL
  Fresh,
  /// Past its TTL but inside the stale-if-error window
  Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
  pub data: Value,
  pub source: CacheSource,
  pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
  data: Value,
  cached_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
  /// Always at or after `expires_at`.
  stale_until: DateTime<Utc>,
}

pub struct ResponseCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  settings: CacheSettings,
  clock: Arc<dyn Clock>,
}

impl ResponseCache {
  pub fn new(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      settings,
      clock,
    }
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  /// Cache key for a GET: `GET:{path}:{header signature}`.
  pub fn key(path: &str, headers: &BTreeMap<String, String>) -> String {
    format!("GET:{}:{}", path, header_signature(headers))
  }

  /// Clamp a requested TTL, falling back to the default TTL when the caller
  /// opted into caching without choosing one. `None` means not cached.
  pub fn effective_ttl(&self, requested: Option<Duration>, use_default: bool) -> Option<Duration> {
    requested
      .or(use_default.then_some(self.settings.default_ttl))
      .filter(|ttl| !ttl.is_zero())
      .map(|ttl| ttl.min(self.settings.max_ttl))
  }

  fn lookup(&self, key: &str, allow_stale: bool) -> Option<CacheHit> {
    let now = self.clock.now();
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let entry = entries.get(key)?;

    if now >= entry.stale_until {
      entries.remove(key);
      return None;
    }
    let source = if now < entry.expires_at {
      CacheSource::Fresh
    } else if allow_stale {
      CacheSource::Stale
    } else {
      return None;
    };
    Some(CacheHit {
      data: entry.data.clone(),
      source,
      cached_at: entry.cached_at,
    })
  }

  /// Entry still within its TTL.
  pub fn get_fresh(&self, key: &str) -> Option<CacheHit> {
    self.lookup(key, false)
  }

  /// Entry within its stale-if-error window, fresh or not.
  pub fn get_stale(&self, key: &str) -> Option<CacheHit> {
    self.lookup(key, true)
  }

  pub fn store(&self, key: &str, data: Value, ttl: Duration, stale_if_error: Option<Duration>) {
    let now = self.clock.now();
    let ttl = ttl.min(self.settings.max_ttl);
    let stale = stale_if_error
      .unwrap_or_default()
      .min(self.settings.max_stale)
      .max(ttl);
    let entry = CacheEntry {
      data,
      cached_at: now,
      expires_at: now + span(ttl),
      stale_until: now + span(stale),
    };
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.to_string(), entry);
  }

  /// Drop every entry.
  pub fn clear(&self) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Order-independent digest of the caller's headers. Names are compared
/// case-insensitively. Empty when there are no headers.
pub fn header_signature(headers: &BTreeMap<String, String>) -> String {
  if headers.is_empty() {
    return String::new();
  }
  let mut pairs: Vec<(String, &str)> = headers
    .iter()
    .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
    .collect();
  pairs.sort();

  let mut hasher = Sha256::new();
  for (name, value) in pairs {
    hasher.update(name.as_bytes());
    hasher.update(b"=");
    hasher.update(value.as_bytes());
    hasher.update(b"\n");
  }
  hex::encode(hasher.finalize())
}
