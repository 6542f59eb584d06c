//! In-process bucket storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{BucketState, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at: i64,
}

/// Bucket storage held in process memory.
///
/// State is lost when the process exits. The mutex only protects the map
/// itself; a bucket's load-check-store cycle is not atomic across callers.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store using the given clock for expiry.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, including ones that have expired but not
    /// yet been evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<BucketState>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at < now => {
                debug!(key = %key, "Evicting expired bucket");
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.state)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, state: BucketState, ttl_secs: u64) -> Result<()> {
        let expires_at = self.clock.now().saturating_add_unsigned(ttl_secs);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { state, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn gc(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        Ok(before - entries.len())
    }
}
