//! Push notifications and the client windows they lead back to.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Client windows remembered at once; the least recently navigated goes first.
const MAX_CLIENT_WINDOWS: usize = 16;

/// Notifications kept open at once; older ones are dismissed.
const MAX_SHOWN_NOTIFICATIONS: usize = 20;

/// Fixed presentation of every notification.
#[derive(Debug, Clone)]
pub struct NotificationStyle {
  pub default_title: String,
  pub icon: String,
  pub badge: String,
}

/// Payload of a push message. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

/// A notification as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: Option<String>,
  pub icon: String,
  pub badge: String,
  /// Page to open when clicked
  pub url: Option<String>,
}

/// An application window the worker can focus or open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientWindow {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Whether the window is controlled by the active worker
  pub controlled: bool,
}

/// What a notification click resulted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClickOutcome {
  Focused { client: u64, url: String },
  Opened { client: u64, url: String },
}

/// Windows of the application seen by the worker.
#[derive(Default)]
pub struct Clients {
  windows: Mutex<Vec<ClientWindow>>,
  next_id: AtomicU64,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a top-level navigation. A window already on `url` is reused and
  /// becomes the most recent one.
  pub fn navigated(&self, url: &str, controlled: bool) -> u64 {
    let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

    let window = match windows.iter().position(|w| w.url == url) {
      Some(index) => {
        let mut window = windows.remove(index);
        window.controlled |= controlled;
        window
      }
      None => ClientWindow {
        id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        url: url.to_string(),
        focused: false,
        controlled,
      },
    };
    let id = window.id;
    windows.push(window);

    if windows.len() > MAX_CLIENT_WINDOWS {
      let excess = windows.len() - MAX_CLIENT_WINDOWS;
      for gone in windows.drain(..excess) {
        debug!(client = gone.id, url = %gone.url, "Forgetting client window");
      }
    }
    id
  }

  /// Take control of every open window without waiting for navigation.
  pub fn claim(&self) -> usize {
    let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
    for window in windows.iter_mut() {
      window.controlled = true;
    }
    windows.len()
  }

  pub fn match_all(&self) -> Vec<ClientWindow> {
    self
      .windows
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn focus(&self, id: u64) {
    let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
    for window in windows.iter_mut() {
      window.focused = window.id == id;
    }
  }

  fn open_window(&self, url: &str) -> u64 {
    let id = self.navigated(url, true);
    self.focus(id);
    id
  }
}

/// Shows notifications from push payloads and routes clicks on them.
pub struct NotificationRelay {
  style: NotificationStyle,
  shown: Mutex<Vec<Notification>>,
  next_id: AtomicU64,
  clients: Arc<Clients>,
}

impl NotificationRelay {
  pub fn new(style: NotificationStyle, clients: Arc<Clients>) -> Self {
    Self {
      style,
      shown: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(0),
      clients,
    }
  }

  /// Handle a push message. Empty or malformed payloads show nothing.
  pub fn push(&self, payload: &[u8]) -> Option<Notification> {
    if payload.is_empty() {
      debug!("Ignoring push without payload");
      return None;
    }

    let payload: PushPayload = match serde_json::from_slice(payload) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "Ignoring push with malformed payload");
        return None;
      }
    };

    let notification = Notification {
      id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
      title: payload
        .title
        .unwrap_or_else(|| self.style.default_title.clone()),
      body: payload.body,
      icon: self.style.icon.clone(),
      badge: self.style.badge.clone(),
      url: payload.url,
    };

    info!(id = notification.id, title = %notification.title, "Showing notification");
    let mut shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
    shown.push(notification.clone());
    if shown.len() > MAX_SHOWN_NOTIFICATIONS {
      let dismissed = shown.remove(0);
      debug!(id = dismissed.id, "Dismissed oldest notification");
    }

    Some(notification)
  }

  /// Notifications currently shown.
  pub fn shown(&self) -> Vec<Notification> {
    self
      .shown
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Close the clicked notification, then focus a window already showing its
  /// target or open a new one. Unknown ids do nothing.
  pub fn click(&self, id: u64) -> Option<ClickOutcome> {
    let notification = {
      let mut shown = self.shown.lock().unwrap_or_else(PoisonError::into_inner);
      let index = shown.iter().position(|n| n.id == id)?;
      shown.remove(index)
    };

    let target = notification.url.unwrap_or_else(|| "/".to_string());

    let existing = self
      .clients
      .match_all()
      .into_iter()
      .find(|window| window.url == target);

    let outcome = match existing {
      Some(window) => {
        self.clients.focus(window.id);
        ClickOutcome::Focused {
          client: window.id,
          url: target,
        }
      }
      None => ClickOutcome::Opened {
        client: self.clients.open_window(&target),
        url: target,
      },
    };

    info!(id, ?outcome, "Notification clicked");
    Some(outcome)
  }
}
