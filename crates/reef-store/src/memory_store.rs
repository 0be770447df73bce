//! In-memory blob storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use reef_types::BlobId;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::BlobStore;

/// In-memory blob store backed by a `RwLock<HashMap>`.
///
/// Useful for testing and for nodes configured to run without a disk.
/// Tracks total bytes stored against an optional maximum.
pub struct MemoryStore {
    blobs: RwLock<HashMap<BlobId, Bytes>>,
    max_bytes: Option<u64>,
}

impl MemoryStore {
    /// Create an in-memory store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_bytes: Some(max_bytes),
        }
    }

    /// Create an in-memory store with no capacity limit.
    pub fn unbounded() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_bytes: None,
        }
    }

    fn used_bytes_unlocked(map: &HashMap<BlobId, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn store(&self, id: BlobId, data: Bytes) -> Result<(), StoreError> {
        let mut map = self.blobs.write().expect("lock poisoned");

        if let Some(max) = self.max_bytes {
            let used = Self::used_bytes_unlocked(&map);
            // If we're replacing an existing blob, account for freed space.
            let existing = map.get(&id).map_or(0, |v| v.len() as u64);
            let net_increase = (data.len() as u64).saturating_sub(existing);
            if used + net_increase > max {
                return Err(StoreError::CapacityExceeded {
                    needed: net_increase,
                    available: max.saturating_sub(used),
                });
            }
        }

        debug!(%id, size = data.len(), "storing blob in memory");
        map.insert(id, data);
        Ok(())
    }

    async fn load(&self, id: BlobId) -> Result<Bytes, StoreError> {
        let map = self.blobs.read().expect("lock poisoned");
        map.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, id: BlobId) -> Result<(), StoreError> {
        let mut map = self.blobs.write().expect("lock poisoned");
        if map.remove(&id).is_some() {
            debug!(%id, "deleted blob from memory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_load_roundtrip() {
        let store = MemoryStore::unbounded();
        let data = Bytes::from_static(b"hello blob");
        let id = BlobId::from_data(b"some key");

        store.store(id, data.clone()).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_load_missing_fails() {
        let store = MemoryStore::unbounded();
        let id = BlobId::from_data(b"never stored");
        assert!(matches!(
            store.load(id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_makes_load_fail() {
        let store = MemoryStore::unbounded();
        let id = BlobId::from_data(b"k");
        store.store(id, Bytes::from_static(b"v")).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.load(id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let store = MemoryStore::unbounded();
        store.delete(BlobId::from_data(b"absent")).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_replaces_existing() {
        let store = MemoryStore::unbounded();
        let id = BlobId::from_data(b"k");
        store.store(id, Bytes::from_static(b"old")).await.unwrap();
        store.store(id, Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let store = MemoryStore::new(10);
        let id = BlobId::from_data(b"k");
        let result = store
            .store(id, Bytes::from_static(b"way too large for this store"))
            .await;
        assert!(matches!(result, Err(StoreError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn test_capacity_accounts_for_replacement() {
        let store = MemoryStore::new(10);
        let id = BlobId::from_data(b"k");
        store.store(id, Bytes::from_static(b"0123456789")).await.unwrap();
        // Replacing with same-size data frees the old copy first.
        store.store(id, Bytes::from_static(b"abcdefghij")).await.unwrap();
    }
}
