//! Storage backends for token bucket state.
//!
//! A backend is a key-value store mapping an opaque rate limit key to one
//! [`BucketState`], with a per-entry expiry. Expiry is purely a storage
//! concern: an expired entry reads as absent and the bucket starts full again.

mod file;
mod memory;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::{FileStore, DEFAULT_LOCK_TIMEOUT, DEFAULT_PREFIX};
pub use memory::MemoryStore;

/// Persisted state of a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Tokens currently available
    pub tokens: f64,
    /// Unix timestamp (seconds) of the last refill computation
    pub last_refill: i64,
}

impl BucketState {
    /// Create a new bucket state.
    pub fn new(tokens: f64, last_refill: i64) -> Self {
        Self {
            tokens,
            last_refill,
        }
    }
}

/// Trait for bucket state storage backends.
///
/// A single store may be shared by many buckets and keys. Implementations
/// must make `set` atomic with respect to concurrent readers of the same key.
pub trait BucketStore: Send + Sync {
    /// Fetch the state for `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<BucketState>>;

    /// Store the state for `key`, expiring `ttl_secs` seconds from now.
    fn set(&self, key: &str, state: BucketState, ttl_secs: u64) -> Result<()>;

    /// Remove the state for `key`. Removing an absent key is a no-op.
    fn delete(&self, key: &str) -> Result<()>;

    /// Remove every entry held by this store.
    fn clear(&self) -> Result<()>;

    /// Remove expired entries, returning how many were removed.
    fn gc(&self) -> Result<usize> {
        Ok(0)
    }
}
