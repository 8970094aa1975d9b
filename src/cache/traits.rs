//! Core traits and types for the response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::BTreeSet;

use super::keys::RequestKey;
use crate::http::Response;

/// Handle to an opened named collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
  name: String,
}

impl CacheHandle {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A response read back from the cache.
#[derive(Debug)]
pub struct CachedResponse {
  /// The stored response, ready to hand to a caller
  pub response: Response,
  /// Collection the entry was found in
  pub collection: String,
  /// When the response was stored
  pub cached_at: DateTime<Utc>,
}

/// Storage for named collections of responses keyed by request.
///
/// Collections have no eviction, size limit or TTL. They live until deleted
/// wholesale.
pub trait ResponseCache: Send + Sync {
  /// Open (creating if needed) the named collection.
  fn open(&self, name: &str) -> Result<CacheHandle>;

  /// Store a response under `key`, replacing any previous entry.
  fn put(&self, handle: &CacheHandle, key: &RequestKey, response: Response) -> Result<()>;

  /// Look up `key` in one collection, or in every collection when `collection`
  /// is `None`. No precedence is defined between collections.
  fn match_key(&self, key: &RequestKey, collection: Option<&str>)
    -> Result<Option<CachedResponse>>;

  /// Delete a collection and all its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Names of all existing collections.
  fn keys(&self) -> Result<BTreeSet<String>>;
}
