//! Scripted transport for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::transport::{HttpTransport, TransportFailure, TransportRequest, TransportResponse};
use crate::api::{ApiClient, ClientSettings, RequestExecutor};
use crate::clock::ManualClock;
use crate::event::ApiEvents;
use crate::signals::HostSignals;

/// One queued outcome.
#[derive(Debug, Clone)]
pub struct Scripted {
  outcome: Result<TransportResponse, TransportFailure>,
  delay: Option<Duration>,
}

impl Scripted {
  pub fn ok(body: Value) -> Self {
    Self::status(200, &body.to_string())
  }

  pub fn status(status: u16, body: &str) -> Self {
    let reason = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();
    Self {
      outcome: Ok(TransportResponse {
        status,
        reason,
        body: body.to_string(),
      }),
      delay: None,
    }
  }

  pub fn fail(message: &str) -> Self {
    Self {
      outcome: Err(TransportFailure(message.to_string())),
      delay: None,
    }
  }

  pub fn delayed(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

/// Replays queued outcomes in order and records every request it sees.
/// An empty script answers `200 {}`.
#[derive(Default)]
pub struct ScriptedTransport {
  script: Mutex<VecDeque<Scripted>>,
  requests: Mutex<Vec<TransportRequest>>,
  calls: AtomicUsize,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, scripted: Scripted) {
    self.script.lock().unwrap().push_back(scripted);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn requests(&self) -> Vec<TransportRequest> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
  async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.requests.lock().unwrap().push(request);
    let next = self.script.lock().unwrap().pop_front();
    let next = next.unwrap_or_else(|| Scripted::ok(serde_json::json!({})));
    if let Some(delay) = next.delay {
      tokio::time::sleep(delay).await;
    }
    next.outcome
  }
}

/// Client wired to a scripted transport and a manual clock, with retry
/// delays shrunk to a millisecond.
pub struct Harness {
  pub transport: Arc<ScriptedTransport>,
  pub clock: ManualClock,
  pub signals: Arc<HostSignals>,
  pub events: ApiEvents,
  pub client: ApiClient,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_settings(|_| {})
  }

  pub fn with_settings(adjust: impl FnOnce(&mut ClientSettings)) -> Self {
    let transport = Arc::new(ScriptedTransport::new());
    let clock = ManualClock::default();
    let signals = Arc::new(HostSignals::new());
    let events = ApiEvents::new();
    let executor = RequestExecutor::new(transport.clone(), "http://tutor.test", "/api", signals.clone());

    let mut settings = ClientSettings::default();
    settings.retry.base_delay = Duration::from_millis(1);
    settings.retry.max_delay = Duration::from_millis(1);
    adjust(&mut settings);

    let client = ApiClient::new(executor, settings, Arc::new(clock.clone()), events.clone());
    Self {
      transport,
      clock,
      signals,
      events,
      client,
    }
  }
}
