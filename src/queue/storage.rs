//! SQLite-backed pending write queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{NewPendingWrite, PendingWrite, QueueCollection};

/// Upgrade steps, applied in order to stores older than their version.
///
/// Steps only ever create what is missing. Existing records survive every
/// upgrade.
const MIGRATIONS: &[(i32, &str)] = &[
  (
    1,
    r#"
CREATE TABLE IF NOT EXISTS pending_journal_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    csrf_token TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  ),
  (
    2,
    r#"
CREATE TABLE IF NOT EXISTS pending_meal_plan_updates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    csrf_token TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  ),
];

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Durable queue of writes waiting for connectivity.
pub struct PendingQueue {
  conn: Mutex<Connection>,
}

impl PendingQueue {
  /// Open the queue database at `path`, creating it on first use.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    upgrade(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Append a record and return its freshly assigned id.
  pub fn enqueue(&self, collection: QueueCollection, record: &NewPendingWrite) -> Result<i64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data = serde_json::to_string(&record.data)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        &format!(
          "INSERT INTO {} (data, csrf_token, created_at) VALUES (?, ?, datetime('now'))",
          collection.table()
        ),
        params![data, record.csrf_token],
      )
      .map_err(|e| eyre!("Failed to enqueue into {}: {}", collection.name(), e))?;

    Ok(conn.last_insert_rowid())
  }

  /// All records of a collection in insertion order.
  pub fn list_all(&self, collection: QueueCollection) -> Result<Vec<PendingWrite>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT id, data, csrf_token, created_at FROM {} ORDER BY id",
        collection.table()
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to list {}: {}", collection.name(), e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", collection.name(), e))?;

    rows
      .into_iter()
      .map(|(id, data, csrf_token, created_at)| {
        Ok(PendingWrite {
          id,
          data: serde_json::from_str(&data)
            .map_err(|e| eyre!("Failed to deserialize record {}: {}", id, e))?,
          csrf_token,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  /// Delete one record. Returns whether it was present.
  pub fn remove(&self, collection: QueueCollection, id: i64) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        &format!("DELETE FROM {} WHERE id = ?", collection.table()),
        params![id],
      )
      .map_err(|e| eyre!("Failed to remove {} from {}: {}", id, collection.name(), e))?;

    Ok(removed > 0)
  }

  /// Number of records waiting in a collection.
  pub fn count(&self, collection: QueueCollection) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", collection.table()),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", collection.name(), e))?;

    Ok(count as usize)
  }
}

/// Bring the schema up to `SCHEMA_VERSION`.
fn upgrade(conn: &mut Connection) -> Result<()> {
  let current: i32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read queue schema version: {}", e))?;

  if current >= SCHEMA_VERSION {
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  for (version, sql) in MIGRATIONS {
    if *version > current {
      tx.execute_batch(sql)
        .map_err(|e| eyre!("Failed to upgrade queue to version {}: {}", version, e))?;
    }
  }

  tx.pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to record queue schema version: {}", e))?;

  tx.commit()
    .map_err(|e| eyre!("Failed to commit queue upgrade: {}", e))?;

  tracing::info!(from = current, to = SCHEMA_VERSION, "Upgraded pending queue schema");
  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn write(food: &str) -> NewPendingWrite {
    NewPendingWrite {
      data: json!({ "food": food, "grams": 100 }),
      csrf_token: "token-abc".to_string(),
    }
  }

  #[test]
  fn test_enqueue_then_list() {
    let queue = PendingQueue::in_memory().unwrap();

    let id = queue
      .enqueue(QueueCollection::JournalEntries, &write("apple"))
      .unwrap();

    let records = queue.list_all(QueueCollection::JournalEntries).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].data, json!({ "food": "apple", "grams": 100 }));
    assert_eq!(records[0].csrf_token, "token-abc");
  }

  #[test]
  fn test_remove_then_list() {
    let queue = PendingQueue::in_memory().unwrap();
    let first = queue
      .enqueue(QueueCollection::JournalEntries, &write("apple"))
      .unwrap();
    let second = queue
      .enqueue(QueueCollection::JournalEntries, &write("pear"))
      .unwrap();

    assert!(queue.remove(QueueCollection::JournalEntries, first).unwrap());
    assert!(!queue.remove(QueueCollection::JournalEntries, first).unwrap());

    let ids: Vec<i64> = queue
      .list_all(QueueCollection::JournalEntries)
      .unwrap()
      .iter()
      .map(|r| r.id)
      .collect();
    assert_eq!(ids, vec![second]);
  }

  #[test]
  fn test_ids_increase_and_are_never_reused() {
    let queue = PendingQueue::in_memory().unwrap();
    let collection = QueueCollection::MealPlanUpdates;

    let a = queue.enqueue(collection, &write("a")).unwrap();
    let b = queue.enqueue(collection, &write("b")).unwrap();
    assert!(b > a);

    queue.remove(collection, b).unwrap();
    let c = queue.enqueue(collection, &write("c")).unwrap();
    assert!(c > b);
  }

  #[test]
  fn test_collections_are_independent() {
    let queue = PendingQueue::in_memory().unwrap();

    let journal = queue
      .enqueue(QueueCollection::JournalEntries, &write("apple"))
      .unwrap();
    let meal = queue
      .enqueue(QueueCollection::MealPlanUpdates, &write("soup"))
      .unwrap();

    // Separate sequences both start at 1
    assert_eq!(journal, 1);
    assert_eq!(meal, 1);
    assert_eq!(queue.count(QueueCollection::JournalEntries).unwrap(), 1);

    queue.remove(QueueCollection::MealPlanUpdates, meal).unwrap();
    assert_eq!(queue.count(QueueCollection::JournalEntries).unwrap(), 1);
    assert_eq!(queue.count(QueueCollection::MealPlanUpdates).unwrap(), 0);
  }

  #[test]
  fn test_list_preserves_insertion_order() {
    let queue = PendingQueue::in_memory().unwrap();
    for food in ["a", "b", "c"] {
      queue
        .enqueue(QueueCollection::JournalEntries, &write(food))
        .unwrap();
    }

    let foods: Vec<String> = queue
      .list_all(QueueCollection::JournalEntries)
      .unwrap()
      .into_iter()
      .map(|r| r.data["food"].as_str().unwrap().to_string())
      .collect();
    assert_eq!(foods, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_upgrade_keeps_existing_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    // A version 1 store only has the journal table
    {
      let conn = Connection::open(&path).unwrap();
      conn.execute_batch(MIGRATIONS[0].1).unwrap();
      conn
        .execute(
          "INSERT INTO pending_journal_entries (data, csrf_token) VALUES ('{\"food\":\"kept\"}', 't')",
          [],
        )
        .unwrap();
      conn.pragma_update(None, "user_version", 1).unwrap();
    }

    let queue = PendingQueue::open(&path).unwrap();

    let journal = queue.list_all(QueueCollection::JournalEntries).unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].data, json!({ "food": "kept" }));
    assert_eq!(queue.count(QueueCollection::MealPlanUpdates).unwrap(), 0);
  }

  #[test]
  fn test_reopen_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");

    let id = {
      let queue = PendingQueue::open(&path).unwrap();
      queue
        .enqueue(QueueCollection::MealPlanUpdates, &write("soup"))
        .unwrap()
    };

    let queue = PendingQueue::open(&path).unwrap();
    let records = queue.list_all(QueueCollection::MealPlanUpdates).unwrap();
    assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id]);
  }
}
