//! Online / degraded / offline status derived from host signals, request
//! outcomes and health probes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::executor::Exchange;
use crate::api::{ApiError, ApiErrorCode, Method, RequestExecutor};
use crate::clock::Clock;
use crate::event::{ApiEvent, ApiEvents};
use crate::outbox::OutboxQueue;
use crate::single_flight::SingleFlight;

/// Failure codes that say the backend is struggling rather than the call
/// being wrong.
const DEGRADING_CODES: [ApiErrorCode; 5] = [
  ApiErrorCode::Timeout,
  ApiErrorCode::NetworkError,
  ApiErrorCode::ServerUnavailable,
  ApiErrorCode::CircuitOpen,
  ApiErrorCode::RateLimited,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
  Online,
  Degraded,
  Offline,
}

impl ConnectivityStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Online => "online",
      Self::Degraded => "degraded",
      Self::Offline => "offline",
    }
  }
}

impl std::fmt::Display for ConnectivityStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
  pub status: ConnectivityStatus,
  pub last_error_code: Option<ApiErrorCode>,
  /// A health probe is in flight
  pub checking: bool,
  pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivitySettings {
  pub health_path: String,
  pub probe_timeout: Duration,
  pub reprobe_interval: Duration,
}

impl Default for ConnectivitySettings {
  fn default() -> Self {
    Self {
      health_path: "/auth/session".to_string(),
      probe_timeout: Duration::from_secs(5),
      reprobe_interval: Duration::from_secs(15),
    }
  }
}

pub struct ConnectivityMonitor {
  executor: RequestExecutor,
  settings: ConnectivitySettings,
  clock: Arc<dyn Clock>,
  events: ApiEvents,
  state: watch::Sender<ConnectivityState>,
  probing: SingleFlight,
  outbox: Mutex<Option<Arc<OutboxQueue>>>,
}

impl ConnectivityMonitor {
  pub fn new(
    executor: RequestExecutor,
    settings: ConnectivitySettings,
    clock: Arc<dyn Clock>,
    events: ApiEvents,
  ) -> Self {
    let status = if executor.signals().is_link_online() {
      ConnectivityStatus::Online
    } else {
      ConnectivityStatus::Offline
    };
    let (state, _rx) = watch::channel(ConnectivityState {
      status,
      last_error_code: None,
      checking: false,
      last_checked_at: None,
    });
    Self {
      executor,
      settings,
      clock,
      events,
      state,
      probing: SingleFlight::new(),
      outbox: Mutex::new(None),
    }
  }

  /// Flush `outbox` whenever the status returns to online and on focus.
  pub fn attach_outbox(&self, outbox: Arc<OutboxQueue>) {
    *self.outbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbox);
  }

  pub fn state(&self) -> ConnectivityState {
    self.state.borrow().clone()
  }

  pub fn status(&self) -> ConnectivityStatus {
    self.state.borrow().status
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  fn transition(&self, status: ConnectivityStatus, last_error_code: Option<ApiErrorCode>) {
    let mut previous = status;
    self.state.send_if_modified(|state| {
      previous = state.status;
      if state.status == status && state.last_error_code == last_error_code {
        return false;
      }
      state.status = status;
      state.last_error_code = last_error_code;
      true
    });

    if previous != status {
      info!(from = %previous, to = %status, code = ?last_error_code, "Connectivity changed");
      if status == ConnectivityStatus::Online {
        self.flush_outbox();
      }
    }
  }

  fn flush_outbox(&self) {
    let outbox = self
      .outbox
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    let Some(outbox) = outbox else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          outbox.flush().await;
        });
      }
      Err(_) => debug!("No runtime, outbox flush skipped"),
    }
  }

  /// The host lost its network link.
  pub fn handle_link_offline(&self) {
    self.executor.signals().set_link_online(false);
    self.transition(ConnectivityStatus::Offline, Some(ApiErrorCode::NetworkOffline));
  }

  /// The host regained its network link. Reports degraded until a probe
  /// confirms the backend is reachable.
  pub async fn handle_link_online(&self) -> Option<ConnectivityStatus> {
    self.executor.signals().set_link_online(true);
    let code = self.state.borrow().last_error_code;
    self.transition(ConnectivityStatus::Degraded, code);
    self.probe().await
  }

  /// Foreground or visibility change. Becoming visible probes and flushes.
  pub async fn handle_visibility(&self, visible: bool) {
    self.executor.signals().set_visible(visible);
    if !visible {
      return;
    }
    self.probe().await;
    self.flush_outbox();
  }

  /// Fold a request outcome into the status.
  pub fn handle_event(&self, event: &ApiEvent) {
    let current = self.status();
    match event {
      ApiEvent::Failure(failure) if DEGRADING_CODES.contains(&failure.code) => {
        if current != ConnectivityStatus::Offline {
          self.transition(ConnectivityStatus::Degraded, Some(failure.code));
        }
      }
      ApiEvent::Success(_) if self.executor.signals().is_link_online() => {
        self.transition(ConnectivityStatus::Online, None);
      }
      _ => {}
    }
  }

  /// Check the health endpoint. Returns `None` when a probe is already
  /// running.
  pub async fn probe(&self) -> Option<ConnectivityStatus> {
    let _permit = self.probing.try_begin()?;
    self.state.send_modify(|state| state.checking = true);

    let mut exchange = Exchange::new(Method::Get, self.settings.health_path.clone());
    exchange
      .headers
      .insert("Content-Type".to_string(), "application/json".to_string());
    exchange.timeout = Some(self.settings.probe_timeout);
    let result = self.executor.execute(exchange).await;

    let (status, code) = self.classify_probe(&result);
    let now = self.clock.now();
    self.state.send_modify(|state| {
      state.checking = false;
      state.last_checked_at = Some(now);
    });
    debug!(status = %status, "Health probe settled");
    self.transition(status, code);
    Some(status)
  }

  fn classify_probe(
    &self,
    result: &Result<serde_json::Value, ApiError>,
  ) -> (ConnectivityStatus, Option<ApiErrorCode>) {
    let err = match result {
      Ok(_) => return (ConnectivityStatus::Online, None),
      Err(err) => err,
    };
    match err.status {
      Some(status) if status >= 500 => (ConnectivityStatus::Degraded, Some(err.code)),
      // The backend answered, so it is reachable.
      Some(_) => (ConnectivityStatus::Online, None),
      None if !self.executor.signals().is_link_online() => {
        (ConnectivityStatus::Offline, Some(ApiErrorCode::NetworkOffline))
      }
      None => (ConnectivityStatus::Degraded, Some(err.code)),
    }
  }

  /// Listen to request events and re-probe periodically while not online,
  /// until `shutdown` fires.
  pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
    let mut events = self.events.subscribe();
    let period = self.settings.reprobe_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        received = events.recv() => match received {
          Ok(event) => self.handle_event(&event),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Connectivity monitor lagged behind request events");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        },
        _ = ticker.tick() => {
          let signals = self.executor.signals();
          if self.status() != ConnectivityStatus::Online
            && signals.is_visible()
            && signals.is_link_online()
          {
            self.probe().await;
          }
        }
      }
    }
    debug!("Connectivity monitor stopped");
  }
}
