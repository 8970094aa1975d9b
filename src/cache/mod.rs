//! Response cache store for offline support.
//!
//! This module provides named, durable collections mapping a request identity
//! to the response last observed for it:
//! - One collection for static assets, one for API responses
//! - Last write wins per key, no eviction or TTL
//! - Stale collections from previous deployments are removed on activation

mod keys;
mod storage;
mod traits;

pub use keys::RequestKey;
pub use storage::{NoopCache, SqliteResponseCache};
pub use traits::{CacheHandle, CachedResponse, ResponseCache};
