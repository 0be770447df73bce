//! Core trait and backend selection for blob storage.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use reef_types::{BackendKind, BlobId};

use crate::error::StoreError;

/// Trait for storing and retrieving value blobs.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Data is passed as [`Bytes`] to keep transfers copy-free where possible.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob under the given ID, replacing any existing copy.
    async fn store(&self, id: BlobId, data: Bytes) -> Result<(), StoreError>;

    /// Load a blob by ID. A missing blob is an error: the caller only
    /// asks for blobs it believes are persisted.
    async fn load(&self, id: BlobId) -> Result<Bytes, StoreError>;

    /// Delete a blob by ID. Deleting an absent blob is not an error.
    async fn delete(&self, id: BlobId) -> Result<(), StoreError>;
}

/// The set of configured backends, selected per value by a
/// [`BackendKind`] tag.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn BlobStore>>,
}

impl BackendSet {
    /// Create an empty backend set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend for the given kind (builder style).
    pub fn with(mut self, kind: BackendKind, store: Arc<dyn BlobStore>) -> Self {
        self.backends.insert(kind, store);
        self
    }

    /// Look up the backend for a kind.
    pub fn get(&self, kind: BackendKind) -> Result<&Arc<dyn BlobStore>, StoreError> {
        self.backends
            .get(&kind)
            .ok_or(StoreError::UnknownBackend(kind))
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("kinds", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    #[tokio::test]
    async fn test_backend_set_lookup() {
        let set = BackendSet::new().with(BackendKind::Memory, Arc::new(MemoryStore::unbounded()));
        assert!(set.get(BackendKind::Memory).is_ok());
        assert!(matches!(
            set.get(BackendKind::Disk),
            Err(StoreError::UnknownBackend(BackendKind::Disk))
        ));
    }
}
