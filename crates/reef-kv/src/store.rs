//! The home-node arbitration map.
//!
//! Each node keeps one of these for the keys it homes under the current
//! cluster view. Publishing a new value atomically replaces the mapping;
//! the *old* value is then locked, its replica bitmap drives the
//! invalidation fan-out, and it is never unlocked — readers that retry
//! re-fetch the mapping and observe the fresh value instead.

use std::sync::Arc;

use dashmap::DashMap;
use reef_types::Key;
use tracing::trace;

use crate::error::KvError;
use crate::replica::ReadAttempt;
use crate::value::Value;

/// Key → value map with reader admission for the home node.
pub struct HomeStore {
    values: DashMap<Key, Arc<Value>>,
}

impl HomeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Look up the current value for a key.
    pub fn get(&self, key: &Key) -> Option<Arc<Value>> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Admit a remote reader on a key.
    ///
    /// Retries while the value is locked by a publishing write — the key
    /// is temporarily unavailable, never an error — yielding to other
    /// work between attempts. Each retry re-fetches the mapping, so a
    /// reader that raced a publish lands on the freshly published value.
    ///
    /// On success the caller owns one active-read slot on the returned
    /// value and must call `state().end_read(reader)` on that same value
    /// once the read is acknowledged.
    pub async fn admit_reader(
        &self,
        key: &Key,
        reader: u32,
    ) -> Result<Option<Arc<Value>>, KvError> {
        loop {
            let Some(value) = self.get(key) else {
                return Ok(None);
            };
            match value.state().begin_read(reader)? {
                ReadAttempt::Admitted => return Ok(Some(value)),
                ReadAttempt::Locked => {
                    trace!(%key, "read hit a publishing write, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Atomically replace the mapping for a key, returning the prior
    /// value. The caller locks the prior value and fans out
    /// invalidations to its recorded holders.
    pub fn publish(&self, key: Key, value: Arc<Value>) -> Option<Arc<Value>> {
        self.values.insert(key, value)
    }

    /// Remove the mapping for a key, returning the prior value for the
    /// same lock-and-invalidate treatment as a publish.
    pub fn remove(&self, key: &Key) -> Option<Arc<Value>> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Whether a key is currently mapped.
    pub fn contains(&self, key: &Key) -> bool {
        self.values.contains_key(key)
    }

    /// Number of keys homed here.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no keys are homed here.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Snapshot of the homed keys.
    pub fn keys(&self) -> Vec<Key> {
        self.values.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for HomeStore {
    fn default() -> Self {
        Self::new()
    }
}
