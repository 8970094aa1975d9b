//! Online/offline tracking and the sync registrations waiting on it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::event::{EventSender, WorkerEvent};
use crate::http::Request;
use crate::net::Network;
use crate::sync::SyncTag;

/// Shared connectivity status plus sync registrations not yet fired.
pub struct Connectivity {
  online: AtomicBool,
  pending: Mutex<BTreeSet<SyncTag>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
      pending: Mutex::new(BTreeSet::new()),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Register a sync. Returns `true` when it should fire right away because
  /// the network is up; otherwise it waits for the next reconnect.
  pub fn register(&self, tag: SyncTag) -> bool {
    if self.is_online() {
      return true;
    }
    self.defer(tag);
    false
  }

  /// Keep a registration for the next reconnect without firing it now.
  pub fn defer(&self, tag: SyncTag) {
    self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(tag);
  }

  /// Registrations waiting for connectivity.
  pub fn pending(&self) -> Vec<SyncTag> {
    self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .copied()
      .collect()
  }

  /// Record the latest observed status. On an offline to online transition
  /// the waiting registrations are drained and returned for firing.
  pub fn set_online(&self, online: bool) -> Vec<SyncTag> {
    let was_online = self.online.swap(online, Ordering::SeqCst);

    match (was_online, online) {
      (false, true) => {
        info!("Connection restored");
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending).into_iter().collect()
      }
      (true, false) => {
        warn!("Connection lost, running offline");
        Vec::new()
      }
      _ => Vec::new(),
    }
  }
}

/// Periodically probes the origin and fires syncs on reconnect.
pub struct ConnectivityMonitor<N: Network> {
  network: N,
  probe_url: Url,
  interval: Duration,
  state: Arc<Connectivity>,
  events: EventSender,
}

impl<N: Network> ConnectivityMonitor<N> {
  pub fn new(
    network: N,
    probe_url: Url,
    interval: Duration,
    state: Arc<Connectivity>,
    events: EventSender,
  ) -> Self {
    Self {
      network,
      probe_url,
      interval,
      state,
      events,
    }
  }

  /// Any response at all, whatever its status, means the origin is reachable.
  async fn probe(&self) -> bool {
    self
      .network
      .fetch(Request::new("HEAD", self.probe_url.clone()))
      .await
      .is_ok()
  }

  /// Probe once and fire any registrations released by a reconnect.
  pub async fn check(&self) {
    let online = self.probe().await;
    for tag in self.state.set_online(online) {
      debug!(%tag, "Firing deferred sync");
      if self
        .events
        .send(WorkerEvent::Sync {
          tag: tag.as_str().to_string(),
        })
        .is_err()
      {
        // Worker is gone; keep it for whoever comes next
        self.state.defer(tag);
      }
    }
  }

  /// Run until the worker stops accepting events.
  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !self.events.is_closed() {
      ticker.tick().await;
      self.check().await;
    }
  }
}
