//! Wiring of the request stack into one handle.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::action_guard::ActionGuard;
use crate::api::{ApiClient, HttpTransport, ReqwestTransport, RequestExecutor};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::event::ApiEvents;
use crate::outbox::OutboxQueue;
use crate::retry_action::RetryLastActionRegistry;
use crate::signals::HostSignals;
use crate::storage::{KvStore, SqliteKvStore};

/// Every long-lived component, sharing one clock, one event bus and one set
/// of host signals.
pub struct App {
  pub config: Config,
  pub signals: Arc<HostSignals>,
  pub events: ApiEvents,
  pub client: ApiClient,
  pub outbox: Arc<OutboxQueue>,
  pub registry: Arc<RetryLastActionRegistry>,
  pub guard: Arc<ActionGuard>,
  pub monitor: Arc<ConnectivityMonitor>,
}

impl App {
  /// Production wiring: reqwest transport and the SQLite store.
  pub fn new(config: Config) -> Result<Self> {
    let transport = Arc::new(ReqwestTransport::new()?);
    let store = match &config.outbox.db_path {
      Some(path) => SqliteKvStore::open(path)?,
      None => SqliteKvStore::open_default()?,
    };
    Self::with_parts(config, transport, Arc::new(store), Arc::new(SystemClock))
  }

  pub fn with_parts(
    config: Config,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let base_url = config.base_url()?;
    let signals = Arc::new(HostSignals::new());
    let events = ApiEvents::new();

    let executor = RequestExecutor::new(
      transport,
      base_url.as_str(),
      &config.api.base_path,
      Arc::clone(&signals),
    )
    .with_default_timeout(config.request_timeout());

    let client = ApiClient::new(
      executor.clone(),
      config.client_settings(),
      Arc::clone(&clock),
      events.clone(),
    );

    let outbox = Arc::new(OutboxQueue::load(
      client.clone(),
      store,
      config.outbox_settings(),
      Arc::clone(&signals),
    ));

    let registry = Arc::new(RetryLastActionRegistry::new(Arc::clone(&clock)));
    let guard = Arc::new(
      ActionGuard::new(Arc::clone(&registry), events.clone(), Arc::clone(&clock))
        .with_timeout(config.guard_timeout()),
    );

    let monitor = Arc::new(ConnectivityMonitor::new(
      executor,
      config.connectivity_settings(),
      clock,
      events.clone(),
    ));
    monitor.attach_outbox(Arc::clone(&outbox));

    info!(base_url = %base_url, queued = outbox.len(), "Request stack ready");

    Ok(Self {
      config,
      signals,
      events,
      client,
      outbox,
      registry,
      guard,
      monitor,
    })
  }
}
