//! File-based blob storage backend.
//!
//! Stores one file per blob with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use reef_types::BlobId;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::BlobStore;

/// File-based blob store with 2-level fan-out directory layout.
///
/// Writes are atomic: data is written to a temporary file first, then
/// renamed into place, so a crash mid-write never leaves a torn blob.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Compute the full file path for a blob ID.
    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let hex = id.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

#[async_trait::async_trait]
impl BlobStore for FileStore {
    async fn store(&self, id: BlobId, data: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(&id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write: temp file in the same directory, then rename.
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(%id, path = %path.display(), size = data.len(), "stored blob to file");
        Ok(())
    }

    async fn load(&self, id: BlobId) -> Result<Bytes, StoreError> {
        let path = self.blob_path(&id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, id: BlobId) -> Result<(), StoreError> {
        let path = self.blob_path(&id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%id, "deleted blob file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_load_roundtrip() {
        let (store, _dir) = make_store();
        let data = Bytes::from_static(b"hello file blob");
        let id = BlobId::from_data(b"some key");

        store.store(id, data.clone()).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_load_missing_fails() {
        let (store, _dir) = make_store();
        let id = BlobId::from_data(b"not stored");
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_makes_load_fail() {
        let (store, _dir) = make_store();
        let id = BlobId::from_data(b"k");
        store.store(id, Bytes::from_static(b"v")).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.load(id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let (store, _dir) = make_store();
        store.delete(BlobId::from_data(b"never stored")).await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_directory_structure() {
        let (store, dir) = make_store();
        let data = Bytes::from_static(b"fanout test data");
        let id = BlobId::from_data(b"fanout key");

        store.store(id, data.clone()).await.unwrap();

        let hex = id.to_string();
        let expected_path = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex);
        assert!(
            expected_path.exists(),
            "blob file should exist at fan-out path: {}",
            expected_path.display()
        );
        assert_eq!(std::fs::read(&expected_path).unwrap(), data.as_ref());
    }

    #[tokio::test]
    async fn test_atomic_write_no_tmp_file_left() {
        let (store, dir) = make_store();
        let id = BlobId::from_data(b"atomic key");
        store.store(id, Bytes::from_static(b"atomic write")).await.unwrap();

        let hex = id.to_string();
        let tmp_path = dir
            .path()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{hex}.tmp"));
        assert!(!tmp_path.exists(), "temp file should not remain after write");
    }

    #[tokio::test]
    async fn test_store_replaces_existing() {
        let (store, _dir) = make_store();
        let id = BlobId::from_data(b"k");
        store.store(id, Bytes::from_static(b"old")).await.unwrap();
        store.store(id, Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.load(id).await.unwrap(), Bytes::from_static(b"new"));
    }
}
