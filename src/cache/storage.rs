//! Response cache storage: SQLite implementation and a no-op fallback.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use super::keys::RequestKey;
use super::traits::{CacheHandle, CachedResponse, ResponseCache};
use crate::http::{HeaderList, Response};

/// Response cache for `cache.enabled: false`. Lookups always miss and writes
/// vanish, so every strategy degrades to plain network access.
pub struct NoopCache;

impl ResponseCache for NoopCache {
  fn open(&self, name: &str) -> Result<CacheHandle> {
    Ok(CacheHandle::new(name))
  }

  fn put(&self, _handle: &CacheHandle, _key: &RequestKey, _response: Response) -> Result<()> {
    Ok(())
  }

  fn match_key(
    &self,
    _key: &RequestKey,
    _collection: Option<&str>,
  ) -> Result<Option<CachedResponse>> {
    Ok(None)
  }

  fn delete(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self) -> Result<BTreeSet<String>> {
    Ok(BTreeSet::new())
  }
}

/// SQLite-based response cache.
pub struct SqliteResponseCache {
  conn: Mutex<Connection>,
}

impl SqliteResponseCache {
  /// Open the cache database at `path`, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Cache that lives only as long as the process.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named collections, in creation order
CREATE TABLE IF NOT EXISTS cache_collections (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One stored response per (collection, request key)
CREATE TABLE IF NOT EXISTS cached_responses (
    collection TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_key ON cached_responses(key_hash);
"#;

impl ResponseCache for SqliteResponseCache {
  fn open(&self, name: &str) -> Result<CacheHandle> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_collections (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(CacheHandle::new(name))
  }

  fn put(&self, handle: &CacheHandle, key: &RequestKey, response: Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let (status, headers, body) = response.into_parts();
    let headers =
      serde_json::to_string(&headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // A handle may outlive its collection if activation deleted it meanwhile
    tx.execute(
      "INSERT OR IGNORE INTO cache_collections (name) VALUES (?)",
      params![handle.name()],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", handle.name(), e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cached_responses
         (collection, key_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        handle.name(),
        key.storage_hash(),
        key.as_str(),
        status,
        headers,
        body.as_ref()
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_key(
    &self,
    key: &RequestKey,
    collection: Option<&str>,
  ) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT r.status, r.headers, r.body, r.collection, r.cached_at
         FROM cached_responses r
         INNER JOIN cache_collections c ON c.name = r.collection
         WHERE r.key_hash = ?1 AND (?2 IS NULL OR r.collection = ?2)
         ORDER BY c.rowid
         LIMIT 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = stmt
      .query_row(params![key.storage_hash(), collection], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, collection, cached_at_str)) => {
        let headers: HeaderList = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;

        Ok(Some(CachedResponse {
          response: Response::new(status, headers, body),
          collection,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cached_responses WHERE collection = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_collections WHERE name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn keys(&self) -> Result<BTreeSet<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_collections")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
