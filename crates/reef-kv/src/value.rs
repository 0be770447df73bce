//! The payload bound to a key.
//!
//! A value's bytes are immutable once observably published: an update
//! replaces the value mapped to the key rather than mutating bytes in
//! place. The bytes may be spilled to a byte backend and dropped from
//! memory; they are reloaded lazily — the store only ever touches the
//! backend when the bytes are not resident.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use reef_store::BackendSet;
use reef_types::{BackendKind, Key};
use tracing::trace;

use crate::error::KvError;
use crate::replica::ReplicaState;

/// A value in the shared address space: bytes, an optional persisted copy
/// behind a backend tag, and the per-value replica word.
pub struct Value {
    /// Resident bytes, or `None` after a spill.
    mem: RwLock<Option<Bytes>>,
    /// Byte length, stable across spill and reload.
    len: usize,
    /// Which backend holds (or would hold) the persisted copy.
    backend: BackendKind,
    /// Whether the backend currently holds a copy.
    persisted: AtomicBool,
    state: ReplicaState,
}

impl Value {
    /// Create a fresh resident value.
    pub fn new(bytes: Bytes, backend: BackendKind) -> Self {
        Self {
            len: bytes.len(),
            mem: RwLock::new(Some(bytes)),
            backend,
            persisted: AtomicBool::new(false),
            state: ReplicaState::new(),
        }
    }

    /// Create a value whose replica word already records one cache
    /// holder — the remote node whose write created it.
    pub fn with_holder(bytes: Bytes, backend: BackendKind, holder: u32) -> Result<Self, KvError> {
        Ok(Self {
            len: bytes.len(),
            mem: RwLock::new(Some(bytes)),
            backend,
            persisted: AtomicBool::new(false),
            state: ReplicaState::with_holder(holder)?,
        })
    }

    /// The replica word arbitrating reads and writes of this value.
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// Byte length of the payload.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backend tag for this value's persisted copy.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Whether a persisted copy currently exists.
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// The bytes if they are resident in memory.
    pub fn resident(&self) -> Option<Bytes> {
        self.mem.read().expect("mem lock poisoned").clone()
    }

    /// The payload bytes, loading from the backend only when not resident.
    pub async fn bytes(&self, key: &Key, backends: &BackendSet) -> Result<Bytes, KvError> {
        if let Some(bytes) = self.resident() {
            return Ok(bytes);
        }
        let store = backends.get(self.backend)?;
        let loaded = store.load(key.blob_id()).await?;
        trace!(%key, size = loaded.len(), "reloaded spilled value");
        let mut slot = self.mem.write().expect("mem lock poisoned");
        // A racing reload may have installed the bytes already; both
        // loads return the same persisted copy.
        Ok(slot.get_or_insert(loaded).clone())
    }

    /// Persist the bytes through the backend and drop them from memory.
    pub async fn spill(&self, key: &Key, backends: &BackendSet) -> Result<(), KvError> {
        if !self.persisted.load(Ordering::Acquire) {
            let Some(bytes) = self.resident() else {
                return Ok(());
            };
            let store = backends.get(self.backend)?;
            store.store(key.blob_id(), bytes).await?;
            self.persisted.store(true, Ordering::Release);
        }
        *self.mem.write().expect("mem lock poisoned") = None;
        trace!(%key, "spilled value to backend");
        Ok(())
    }

    /// Delete the persisted copy, if any. Used when the key is removed.
    pub async fn purge(&self, key: &Key, backends: &BackendSet) -> Result<(), KvError> {
        if self.persisted.swap(false, Ordering::AcqRel) {
            backends.get(self.backend)?.delete(key.blob_id()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("len", &self.len)
            .field("backend", &self.backend)
            .field("resident", &self.resident().is_some())
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reef_store::MemoryStore;

    use super::*;

    fn backends() -> BackendSet {
        BackendSet::new().with(BackendKind::Memory, Arc::new(MemoryStore::unbounded()))
    }

    #[tokio::test]
    async fn test_resident_bytes_need_no_backend() {
        let value = Value::new(Bytes::from_static(b"payload"), BackendKind::Memory);
        // An empty backend set: resident reads must not touch it.
        let empty = BackendSet::new();
        let key = Key::from("k");
        assert_eq!(
            value.bytes(&key, &empty).await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn test_spill_then_reload() {
        let backends = backends();
        let key = Key::from("spilled");
        let value = Value::new(Bytes::from_static(b"big payload"), BackendKind::Memory);

        value.spill(&key, &backends).await.unwrap();
        assert!(value.resident().is_none(), "spill frees the memory copy");
        assert!(value.is_persisted());
        assert_eq!(value.len(), 11, "length survives the spill");

        let reloaded = value.bytes(&key, &backends).await.unwrap();
        assert_eq!(reloaded, Bytes::from_static(b"big payload"));
        assert!(value.resident().is_some(), "reload re-installs the bytes");
    }

    #[tokio::test]
    async fn test_double_spill_is_idempotent() {
        let backends = backends();
        let key = Key::from("k");
        let value = Value::new(Bytes::from_static(b"v"), BackendKind::Memory);
        value.spill(&key, &backends).await.unwrap();
        value.spill(&key, &backends).await.unwrap();
        assert_eq!(value.bytes(&key, &backends).await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_purge_deletes_persisted_copy() {
        let backends = backends();
        let key = Key::from("doomed");
        let value = Value::new(Bytes::from_static(b"v"), BackendKind::Memory);

        value.spill(&key, &backends).await.unwrap();
        value.purge(&key, &backends).await.unwrap();
        assert!(!value.is_persisted());
        // The blob is gone, so a reload now fails with a backend fault.
        assert!(value.bytes(&key, &backends).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_without_spill_is_a_noop() {
        let backends = backends();
        let key = Key::from("k");
        let value = Value::new(Bytes::from_static(b"v"), BackendKind::Memory);
        value.purge(&key, &backends).await.unwrap();
        assert_eq!(value.bytes(&key, &backends).await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_missing_backend_is_an_error() {
        let key = Key::from("k");
        let value = Value::new(Bytes::from_static(b"v"), BackendKind::Disk);
        let result = value.spill(&key, &BackendSet::new()).await;
        assert!(result.is_err(), "spilling without a configured backend fails");
    }
}
