//! Background sync: replay queued writes once connectivity returns.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::http::Request;
use crate::net::Network;
use crate::queue::{PendingQueue, PendingWrite, QueueCollection};

/// Header carrying the anti-forgery token captured with each record.
const CSRF_HEADER: &str = "X-CSRFToken";

/// The recognized sync registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncTag {
  Journal,
  MealPlan,
}

impl SyncTag {
  pub const ALL: [SyncTag; 2] = [SyncTag::Journal, SyncTag::MealPlan];

  /// Parse a registration tag. Unknown tags yield `None`.
  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "sync-journal-entries" => Some(Self::Journal),
      "sync-meal-plan-updates" => Some(Self::MealPlan),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Journal => "sync-journal-entries",
      Self::MealPlan => "sync-meal-plan-updates",
    }
  }

  /// Queue collection drained by this tag.
  pub fn collection(&self) -> QueueCollection {
    match self {
      Self::Journal => QueueCollection::JournalEntries,
      Self::MealPlan => QueueCollection::MealPlanUpdates,
    }
  }

  /// Server endpoint each record is replayed against.
  pub fn endpoint(&self) -> &'static str {
    match self {
      Self::Journal => "/api/add-food-to-journal/",
      Self::MealPlan => "/api/update-meal-plan/",
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Records found in the queue at the start of the run
  pub attempted: usize,
  /// Records the server confirmed
  pub synced: usize,
  /// Records left in place for the next trigger
  pub failed: usize,
}

impl SyncReport {
  pub fn has_leftovers(&self) -> bool {
    self.failed > 0
  }
}

/// At most one run per tag in flight.
///
/// A request for a tag that is already running is folded into a single
/// follow-up run, which starts once the current one returns.
#[derive(Debug, Default)]
pub struct SyncSlots {
  /// Running tags, mapped to whether a follow-up run was requested
  running: Mutex<BTreeMap<SyncTag, bool>>,
}

impl SyncSlots {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim the slot for `tag`. Returns `false` when a run is already in
  /// flight; that run is then told to go again.
  pub fn acquire(&self, tag: SyncTag) -> bool {
    let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    match running.entry(tag) {
      Entry::Occupied(mut slot) => {
        *slot.get_mut() = true;
        false
      }
      Entry::Vacant(slot) => {
        slot.insert(false);
        true
      }
    }
  }

  /// Called when a run returns. Returns `true` when another run was
  /// requested meanwhile, in which case the caller keeps the slot.
  pub fn finish(&self, tag: SyncTag) -> bool {
    let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    match running.get_mut(&tag) {
      Some(again) if *again => {
        *again = false;
        true
      }
      _ => {
        running.remove(&tag);
        false
      }
    }
  }
}

/// Drains queue collections by replaying each record against the server.
///
/// Delivery is at-least-once: a record whose write succeeded but whose removal
/// failed is sent again on the next run. No idempotency key is attached.
pub struct SyncEngine<N: Network> {
  network: N,
  queue: Arc<PendingQueue>,
  origin: Url,
}

impl<N: Network> SyncEngine<N> {
  pub fn new(network: N, queue: Arc<PendingQueue>, origin: Url) -> Self {
    Self {
      network,
      queue,
      origin,
    }
  }

  /// Replay every pending record of `tag`'s collection, in order.
  ///
  /// A failed record is logged and kept; the run moves on to the next one.
  pub async fn run(&self, tag: SyncTag) -> SyncReport {
    let collection = tag.collection();

    let pending = match self.queue.list_all(collection) {
      Ok(pending) => pending,
      Err(e) => {
        error!(%tag, error = %e, "Error accessing local queue");
        return SyncReport::default();
      }
    };

    if pending.is_empty() {
      debug!(%tag, "Nothing to sync");
      return SyncReport::default();
    }

    info!(%tag, count = pending.len(), "Syncing pending writes");

    let mut report = SyncReport {
      attempted: pending.len(),
      ..SyncReport::default()
    };

    for record in pending {
      if self.replay(tag, &record).await {
        report.synced += 1;
        match self.queue.remove(collection, record.id) {
          Ok(_) => info!(%tag, id = record.id, "Write synced and removed"),
          // The server already has it; the next run will send it again
          Err(e) => error!(%tag, id = record.id, error = %e, "Synced write could not be removed"),
        }
      } else {
        report.failed += 1;
      }
    }

    info!(
      %tag,
      synced = report.synced,
      failed = report.failed,
      "Sync run finished"
    );
    report
  }

  /// Send one record. Returns whether the server confirmed it.
  async fn replay(&self, tag: SyncTag, record: &PendingWrite) -> bool {
    let url = match self.origin.join(tag.endpoint()) {
      Ok(url) => url,
      Err(e) => {
        error!(%tag, error = %e, "Invalid sync endpoint");
        return false;
      }
    };

    let body = match serde_json::to_vec(&record.data) {
      Ok(body) => body,
      Err(e) => {
        error!(%tag, id = record.id, error = %e, "Failed to encode pending write");
        return false;
      }
    };

    let request = Request::post_json(url, body).with_header(CSRF_HEADER, &record.csrf_token);

    match self.network.fetch(request).await {
      Ok(response) if response.is_ok() => true,
      Ok(response) => {
        let status = response.status();
        let text = String::from_utf8_lossy(response.body()).into_owned();
        warn!(%tag, id = record.id, status, body = %text, "Server rejected pending write");
        false
      }
      Err(e) => {
        warn!(%tag, id = record.id, error = %e, "Error syncing pending write");
        false
      }
    }
  }
}
