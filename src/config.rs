use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::action_guard::DEFAULT_GUARD_TIMEOUT;
use crate::api::{CacheSettings, CircuitSettings, ClientSettings, RetrySettings};
use crate::backoff::BackoffPolicy;
use crate::connectivity::ConnectivitySettings;
use crate::outbox::OutboxSettings;

/// Environment variable overriding `api.base_url`.
pub const BASE_URL_ENV: &str = "TUTORLINK_BASE_URL";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub retry: RetryConfig,
  pub circuit: CircuitConfig,
  pub cache: CacheConfig,
  pub outbox: OutboxConfig,
  pub connectivity: ConnectivityConfig,
  pub action_guard: ActionGuardConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
  /// Origin of the backend, e.g. `https://tutor.example.com`
  pub base_url: Option<String>,
  pub base_path: String,
  pub timeout_ms: u64,
  /// Lightweight endpoint used for connectivity probes
  pub health_path: String,
  pub idempotency_prefix: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      base_path: "/api".to_string(),
      timeout_ms: 12_000,
      health_path: "/auth/session".to_string(),
      idempotency_prefix: "api".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let defaults = RetrySettings::default();
    Self {
      max_retries: defaults.max_retries,
      base_delay_ms: millis(defaults.base_delay),
      max_delay_ms: millis(defaults.max_delay),
      retryable_statuses: defaults.retryable_statuses,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
  pub failure_threshold: usize,
  pub window_ms: u64,
  pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
  fn default() -> Self {
    let defaults = CircuitSettings::default();
    Self {
      failure_threshold: defaults.failure_threshold,
      window_ms: millis(defaults.window),
      cooldown_ms: millis(defaults.cooldown.base),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_ms: u64,
  pub max_ttl_ms: u64,
  pub max_stale_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let defaults = CacheSettings::default();
    Self {
      default_ttl_ms: millis(defaults.default_ttl),
      max_ttl_ms: millis(defaults.max_ttl),
      max_stale_ms: millis(defaults.max_stale),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
  pub storage_key: String,
  pub max_age_hours: u64,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// SQLite file holding the queue (defaults to the data directory)
  pub db_path: Option<PathBuf>,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    let defaults = OutboxSettings::default();
    Self {
      storage_key: defaults.storage_key,
      max_age_hours: defaults.max_age.as_secs() / 3600,
      base_delay_ms: millis(defaults.backoff.base),
      max_delay_ms: millis(defaults.backoff.max),
      db_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_timeout_ms: u64,
  pub reprobe_interval_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    let defaults = ConnectivitySettings::default();
    Self {
      probe_timeout_ms: millis(defaults.probe_timeout),
      reprobe_interval_ms: millis(defaults.reprobe_interval),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionGuardConfig {
  pub timeout_ms: u64,
}

impl Default for ActionGuardConfig {
  fn default() -> Self {
    Self {
      timeout_ms: millis(DEFAULT_GUARD_TIMEOUT),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter used when `RUST_LOG` is unset
  pub level: String,
  /// Also write a daily log file in the data directory
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: true,
    }
  }
}

fn millis(duration: Duration) -> u64 {
  duration.as_millis() as u64
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tutorlink.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tutorlink/config.yaml
  ///
  /// Without a file every section takes its defaults. `TUTORLINK_BASE_URL`
  /// overrides `api.base_url` either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
      config.api.base_url = Some(base_url);
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tutorlink.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tutorlink").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty document deserializes as unit, not as an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The validated backend origin.
  pub fn base_url(&self) -> Result<url::Url> {
    let raw = self.api.base_url.as_deref().ok_or_else(|| {
      eyre!(
        "No API base URL configured. Set api.base_url in tutorlink.yaml or the {} environment variable.",
        BASE_URL_ENV
      )
    })?;
    let url = url::Url::parse(raw).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("Unsupported API base URL scheme: {}", other)),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  pub fn client_settings(&self) -> ClientSettings {
    ClientSettings {
      retry: RetrySettings {
        max_retries: self.retry.max_retries,
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        max_delay: Duration::from_millis(self.retry.max_delay_ms),
        retryable_statuses: self.retry.retryable_statuses.clone(),
      },
      circuit: CircuitSettings {
        failure_threshold: self.circuit.failure_threshold.max(1),
        window: Duration::from_millis(self.circuit.window_ms),
        cooldown: BackoffPolicy::fixed(Duration::from_millis(self.circuit.cooldown_ms)),
      },
      cache: CacheSettings {
        default_ttl: Duration::from_millis(self.cache.default_ttl_ms),
        max_ttl: Duration::from_millis(self.cache.max_ttl_ms),
        max_stale: Duration::from_millis(self.cache.max_stale_ms),
      },
      idempotency_prefix: self.api.idempotency_prefix.clone(),
    }
  }

  pub fn outbox_settings(&self) -> OutboxSettings {
    let defaults = OutboxSettings::default();
    OutboxSettings {
      storage_key: self.outbox.storage_key.clone(),
      max_age: Duration::from_secs(self.outbox.max_age_hours * 3600),
      backoff: BackoffPolicy::new(
        Duration::from_millis(self.outbox.base_delay_ms),
        Duration::from_millis(self.outbox.max_delay_ms),
      )
      .with_jitter(defaults.backoff.jitter_min, defaults.backoff.jitter_max),
    }
  }

  pub fn connectivity_settings(&self) -> ConnectivitySettings {
    ConnectivitySettings {
      health_path: self.api.health_path.clone(),
      probe_timeout: Duration::from_millis(self.connectivity.probe_timeout_ms),
      reprobe_interval: Duration::from_millis(self.connectivity.reprobe_interval_ms.max(1)),
    }
  }

  pub fn guard_timeout(&self) -> Duration {
    Duration::from_millis(self.action_guard.timeout_ms)
  }
}
