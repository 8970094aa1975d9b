//! Persistent queue of writes made while offline.
//!
//! Records are created by the application when a write cannot reach the
//! server and removed by the sync engine once the server confirms them.

mod storage;

pub use storage::PendingQueue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two independent record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueCollection {
  JournalEntries,
  MealPlanUpdates,
}

impl QueueCollection {
  /// Store name as the web app refers to it.
  pub fn name(&self) -> &'static str {
    match self {
      Self::JournalEntries => "pendingJournalEntries",
      Self::MealPlanUpdates => "pendingMealPlanUpdates",
    }
  }

  fn table(&self) -> &'static str {
    match self {
      Self::JournalEntries => "pending_journal_entries",
      Self::MealPlanUpdates => "pending_meal_plan_updates",
    }
  }
}

/// A queued write before it has been assigned an id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewPendingWrite {
  /// Request payload, replayed verbatim as the JSON body
  pub data: serde_json::Value,
  /// Anti-forgery token captured when the write was made
  pub csrf_token: String,
}

/// A queued write as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWrite {
  pub id: i64,
  pub data: serde_json::Value,
  pub csrf_token: String,
  pub created_at: DateTime<Utc>,
}
