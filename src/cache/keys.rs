//! Request identity for the response cache.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Base used to resolve bare paths into URLs for normalization.
const KEY_BASE: &str = "http://cache.invalid/";

/// Normalized request identity: path plus query, fragment dropped.
///
/// Every cached request is same-origin, so the origin is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn from_url(url: &Url) -> Self {
    let mut key = url.path().to_string();
    if let Some(query) = url.query() {
      key.push('?');
      key.push_str(query);
    }
    Self(key)
  }

  /// Build a key from a path such as `/offline/` or `/static/app.js?v=2`.
  pub fn from_path(path: &str) -> Self {
    match Url::parse(KEY_BASE).and_then(|base| base.join(path)) {
      Ok(url) => Self::from_url(&url),
      Err(_) => Self(path.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Stable fixed-length hash used as the storage key.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
