use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

use crate::http::{Request, Response};
use crate::net::NetworkError;
use crate::notify::ClickOutcome;

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// A new version is being installed
  Install,
  /// The installed version takes over
  Activate,
  /// The application issued a request
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Result<Response, NetworkError>>,
  },
  /// Connectivity is back and a sync registration exists
  Sync { tag: String },
  /// A push message arrived
  Push { payload: Bytes },
  /// The user clicked a shown notification
  NotificationClick {
    id: u64,
    respond_to: oneshot::Sender<Option<ClickOutcome>>,
  },
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Lifetime token of a dispatched event.
///
/// Work registered with `wait_until` keeps the event alive: the dispatcher
/// does not consider the event handled until all of it has completed.
#[derive(Default)]
pub struct ExtendableEvent {
  pending: Vec<BoxFuture<'static, ()>>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.pending.push(Box::pin(work));
  }

  /// Resolves once every registered piece of work has finished.
  pub fn settled(self) -> impl Future<Output = ()> + Send + 'static {
    let pending = self.pending;
    async move {
      join_all(pending).await;
    }
  }
}

/// Inbound event channel for the worker
pub struct EventHandler {
  tx: EventSender,
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Get a sender for producers (HTTP front, connectivity monitor)
  pub fn sender(&self) -> EventSender {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}

/// Deliver a fetch event and wait for the worker's answer.
pub async fn fetch(events: &EventSender, request: Request) -> Result<Response, NetworkError> {
  let (respond_to, response) = oneshot::channel();

  events
    .send(WorkerEvent::Fetch {
      request,
      respond_to,
    })
    .map_err(|_| NetworkError::Unreachable("worker is not running".to_string()))?;

  response
    .await
    .map_err(|_| NetworkError::Unreachable("worker dropped the request".to_string()))?
}
