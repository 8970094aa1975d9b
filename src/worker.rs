//! Worker lifecycle and event dispatch.
//!
//! The worker owns its lifecycle state and handles one inbound event at a
//! time. Lifecycle events (install, activate) are settled before the next
//! event is looked at; every other event's work is anchored to its lifetime
//! token and tracked in a `JoinSet` until done, so fetches and syncs may
//! interleave at await points.

use color_eyre::Result;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheHandle, RequestKey, ResponseCache};
use crate::connectivity::Connectivity;
use crate::event::{EventHandler, ExtendableEvent, WorkerEvent};
use crate::http::{Request, Response};
use crate::net::{Network, NetworkError};
use crate::notify::{Clients, NotificationRelay};
use crate::queue::PendingQueue;
use crate::router::{RequestRouter, RouteTable};
use crate::sync::{SyncEngine, SyncSlots, SyncTag};

/// Lifecycle of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
}

enum Next {
  Event(Option<WorkerEvent>),
  Finished(Result<(), JoinError>),
}

/// Collaborators shared between the worker and the HTTP front.
#[derive(Clone)]
pub struct Shared {
  pub queue: Arc<PendingQueue>,
  pub connectivity: Arc<Connectivity>,
  pub clients: Arc<Clients>,
  pub relay: Arc<NotificationRelay>,
}

pub struct Worker<N: Network, C: ResponseCache + 'static> {
  network: N,
  cache: Arc<C>,
  router: RequestRouter<N, C>,
  sync: Arc<SyncEngine<N>>,
  sync_slots: Arc<SyncSlots>,
  origin: Url,
  precache: Arc<Vec<String>>,
  shared: Shared,
  state: watch::Sender<WorkerState>,
  tasks: JoinSet<()>,
}

impl<N: Network, C: ResponseCache + 'static> Worker<N, C> {
  pub fn new(
    network: N,
    cache: Arc<C>,
    routes: RouteTable,
    precache: Vec<String>,
    origin: Url,
    shared: Shared,
  ) -> (Self, watch::Receiver<WorkerState>) {
    let (state, state_rx) = watch::channel(WorkerState::Parsed);
    let router = RequestRouter::new(network.clone(), Arc::clone(&cache), routes);
    let sync = SyncEngine::new(network.clone(), Arc::clone(&shared.queue), origin.clone());

    let worker = Self {
      network,
      cache,
      router,
      sync: Arc::new(sync),
      sync_slots: Arc::new(SyncSlots::new()),
      origin,
      precache: Arc::new(precache),
      shared,
      state,
      tasks: JoinSet::new(),
    };

    (worker, state_rx)
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  fn set_state(&self, state: WorkerState) {
    self.state.send_replace(state);
    debug!(?state, "Worker state changed");
  }

  /// Handle events until the channel closes, then wait for in-flight work.
  pub async fn run(mut self, mut events: EventHandler) {
    loop {
      let next = tokio::select! {
        event = events.next() => Next::Event(event),
        Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => Next::Finished(result),
      };

      match next {
        Next::Event(Some(event)) => self.dispatch(event).await,
        Next::Event(None) => break,
        Next::Finished(Err(e)) => error!(error = %e, "Event handler failed"),
        Next::Finished(Ok(())) => {}
      }
    }

    self.drain().await;
  }

  /// Wait for all outstanding event work.
  pub async fn drain(&mut self) {
    while let Some(result) = self.tasks.join_next().await {
      if let Err(e) = result {
        error!(error = %e, "Event handler failed");
      }
    }
  }

  pub async fn dispatch(&mut self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install => self.install().await,
      WorkerEvent::Activate => self.activate().await,
      WorkerEvent::Fetch {
        request,
        respond_to,
      } => self.on_fetch(request, respond_to),
      WorkerEvent::Sync { tag } => self.on_sync(&tag),
      WorkerEvent::Push { payload } => {
        self.shared.relay.push(&payload);
      }
      WorkerEvent::NotificationClick { id, respond_to } => {
        let _ = respond_to.send(self.shared.relay.click(id));
      }
    }
  }

  /// Precache the static assets, then activate without waiting for older
  /// instances to go away.
  async fn install(&mut self) {
    self.set_state(WorkerState::Installing);

    let mut event = ExtendableEvent::new();
    event.wait_until(precache(
      self.network.clone(),
      Arc::clone(&self.cache),
      self.router.routes().static_cache.clone(),
      self.origin.clone(),
      Arc::clone(&self.precache),
    ));
    event.settled().await;

    self.set_state(WorkerState::Installed);
    info!("Worker installed, skipping wait");
    self.activate().await;
  }

  /// Retire stale collections and take control of open clients.
  async fn activate(&mut self) {
    match self.state() {
      WorkerState::Activating | WorkerState::Activated => {
        debug!("Worker already active");
        return;
      }
      WorkerState::Parsed | WorkerState::Installing => {
        warn!("Activation requested before install, ignoring");
        return;
      }
      WorkerState::Installed => {}
    }

    self.set_state(WorkerState::Activating);

    let mut event = ExtendableEvent::new();

    let clients = Arc::clone(&self.shared.clients);
    event.wait_until(async move {
      let claimed = clients.claim();
      info!(claimed, "Claimed open clients");
    });

    let cache = Arc::clone(&self.cache);
    let keep = [
      self.router.routes().static_cache.clone(),
      self.router.routes().api_cache.clone(),
    ];
    event.wait_until(async move {
      if let Err(e) = retire_stale_caches(cache.as_ref(), &keep) {
        error!(error = %e, "Failed to clean up old caches");
      }
    });

    event.settled().await;
    self.set_state(WorkerState::Activated);
    info!("Worker activated");
  }

  fn on_fetch(
    &mut self,
    request: Request,
    respond_to: oneshot::Sender<Result<Response, NetworkError>>,
  ) {
    let controlling = self.state() == WorkerState::Activated;

    if request.is_navigation() {
      let page = RequestKey::from_url(&request.url);
      self.shared.clients.navigated(page.as_str(), controlling);
    }

    let mut event = ExtendableEvent::new();
    if controlling {
      let router = self.router.clone();
      event.wait_until(async move {
        let _ = respond_to.send(router.handle(request).await);
      });
    } else {
      // Not in control yet: behave as if no worker were installed
      let network = self.network.clone();
      event.wait_until(async move {
        let _ = respond_to.send(network.fetch(request).await);
      });
    }

    self.tasks.spawn(event.settled());
  }

  fn on_sync(&mut self, raw_tag: &str) {
    let Some(tag) = SyncTag::parse(raw_tag) else {
      debug!(tag = raw_tag, "Ignoring unknown sync tag");
      return;
    };

    if !self.sync_slots.acquire(tag) {
      debug!(%tag, "Sync already running, queued one more pass");
      return;
    }

    let sync = Arc::clone(&self.sync);
    let slots = Arc::clone(&self.sync_slots);
    let connectivity = Arc::clone(&self.shared.connectivity);

    let mut event = ExtendableEvent::new();
    event.wait_until(async move {
      loop {
        let report = sync.run(tag).await;
        if slots.finish(tag) {
          continue;
        }
        if report.has_leftovers() {
          connectivity.defer(tag);
        }
        break;
      }
    });

    self.tasks.spawn(event.settled());
  }
}

/// Delete every collection not in `keep`. Returns the deleted names.
pub fn retire_stale_caches<C: ResponseCache + ?Sized>(
  cache: &C,
  keep: &[String],
) -> Result<Vec<String>> {
  let mut deleted = Vec::new();

  for name in cache.keys()? {
    if keep.contains(&name) {
      continue;
    }
    info!(cache = %name, "Deleting old cache");
    if cache.delete(&name)? {
      deleted.push(name);
    }
  }

  Ok(deleted)
}

/// Fetch every listed path into the static collection.
///
/// Each path fails on its own: an error is logged and the others continue.
async fn precache<N: Network, C: ResponseCache>(
  network: N,
  cache: Arc<C>,
  collection: String,
  origin: Url,
  paths: Arc<Vec<String>>,
) {
  let handle = match cache.open(&collection) {
    Ok(handle) => handle,
    Err(e) => {
      error!(cache = %collection, error = %e, "Could not open static cache");
      return;
    }
  };
  info!(cache = %collection, "Cache opened for static resources");

  let adds = paths
    .iter()
    .map(|path| add(&network, cache.as_ref(), &handle, &origin, path));

  let added = join_all(adds)
    .await
    .into_iter()
    .filter(|ok| *ok)
    .count();

  info!(added, total = paths.len(), "Precache finished");
}

/// Fetch one path and store it when the response is ok.
async fn add<N: Network, C: ResponseCache>(
  network: &N,
  cache: &C,
  handle: &CacheHandle,
  origin: &Url,
  path: &str,
) -> bool {
  let url = match origin.join(path) {
    Ok(url) => url,
    Err(e) => {
      error!(path, error = %e, "Could not add to cache");
      return false;
    }
  };
  let key = RequestKey::from_url(&url);

  let response = match network.fetch(Request::get(url)).await {
    Ok(response) if response.is_ok() => response,
    Ok(response) => {
      error!(path, status = response.status(), "Could not add to cache");
      return false;
    }
    Err(e) => {
      error!(path, error = %e, "Could not add to cache");
      return false;
    }
  };

  match cache.put(handle, &key, response) {
    Ok(()) => true,
    Err(e) => {
      error!(path, error = %e, "Could not add to cache");
      false
    }
  }
}
