//! File-based storage backend
//!
//! Persists each record as its own JSON document under
//! `<root>/<collection>/<id>.json`.

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{ensure_id, merge_patch, Filter, StorageBackend, StorageError};

const RECORD_EXT: &str = "json";

/// File-per-record storage backend
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so a reader never observes a partially written record and a
/// completed write is visible to every later read from this process.
///
/// Read-modify-write operations (`create`, `update_by_id`) are serialized
/// through an internal lock. No cross-process locking is attempted.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StorageError> {
        validate_segment("collection", collection)?;
        Ok(self.root.join(collection))
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf, StorageError> {
        validate_segment("id", id)?;
        Ok(self
            .collection_dir(collection)?
            .join(format!("{}.{}", id, RECORD_EXT)))
    }

    async fn read_record(path: &Path) -> Result<Option<Value>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(path: &Path, record: &Value) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}.tmp-{}", RECORD_EXT, uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Paths of every committed record in a collection
    async fn record_paths(&self, collection: &str) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Reject names that could escape the store root
fn validate_segment(kind: &str, value: &str) -> Result<(), StorageError> {
    let bad = value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0');
    if bad {
        return Err(StorageError::InvalidRecord(format!(
            "invalid {} name: {:?}",
            kind, value
        )));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn is_healthy(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn create(&self, collection: &str, record: Value) -> Result<Value, StorageError> {
        let (id, record) = ensure_id(record)?;
        let path = self.record_path(collection, &id)?;

        let _guard = self.write_lock.lock().await;
        if fs::try_exists(&path).await? {
            return Err(StorageError::AlreadyExists(format!("{}/{}", collection, id)));
        }
        Self::write_record(&path, &record).await?;
        Ok(record)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let path = self.record_path(collection, id)?;
        Self::read_record(&path).await
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        let mut out = Vec::new();
        for path in self.record_paths(collection).await? {
            match Self::read_record(&path).await {
                Ok(Some(record)) if filter.matches(&record) => out.push(record),
                Ok(_) => {}
                Err(StorageError::Serialization(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Option<Value>, StorageError> {
        let path = self.record_path(collection, id)?;

        let _guard = self.write_lock.lock().await;
        let Some(mut record) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        merge_patch(&mut record, patch)?;
        Self::write_record(&path, &record).await?;
        Ok(Some(record))
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let path = self.record_path(collection, id)?;

        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for path in self.record_paths(collection).await? {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_backend_crud() {
        let dir = tempdir().unwrap();
        let store = FileBackend::open(dir.path()).await.unwrap();
        assert!(store.is_healthy().await);

        store
            .create("jobs", json!({"id": "j1", "status": "Pending"}))
            .await
            .unwrap();
        assert!(dir.path().join("jobs").join("j1.json").exists());

        let found = store.find_by_id("jobs", "j1").await.unwrap().unwrap();
        assert_eq!(found["status"], "Pending");

        let updated = store
            .update_by_id("jobs", "j1", json!({"status": "Running"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["status"], "Running");

        // Visible to a subsequent read
        let reread = store.find_by_id("jobs", "j1").await.unwrap().unwrap();
        assert_eq!(reread["status"], "Running");

        assert!(store.delete_by_id("jobs", "j1").await.unwrap());
        assert!(store.find_by_id("jobs", "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = FileBackend::open(dir.path()).await.unwrap();

        assert!(store.find_by_id("jobs", "missing").await.unwrap().is_none());
        assert!(store
            .update_by_id("jobs", "missing", json!({"a": 1}))
            .await
            .unwrap()
            .is_none());
        assert!(!store.delete_by_id("jobs", "missing").await.unwrap());
        assert!(store.find("jobs", &Filter::new()).await.unwrap().is_empty());
        assert_eq!(store.delete_all("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let dir = tempdir().unwrap();
        let store = FileBackend::open(dir.path()).await.unwrap();

        store.create("jobs", json!({"id": "dup"})).await.unwrap();
        let err = store.create("jobs", json!({"id": "dup"})).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = FileBackend::open(dir.path()).await.unwrap();

        let err = store
            .create("jobs", json!({"id": "../escape"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));

        let err = store.find_by_id("../etc", "passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_find_filters_and_skips_corrupt_files() {
        let dir = tempdir().unwrap();
        let store = FileBackend::open(dir.path()).await.unwrap();

        store
            .create("jobs", json!({"id": "a", "status": "Pending"}))
            .await
            .unwrap();
        store
            .create("jobs", json!({"id": "b", "status": "Completed"}))
            .await
            .unwrap();
        std::fs::write(dir.path().join("jobs").join("broken.json"), b"{not json").unwrap();

        let pending = store
            .find("jobs", &Filter::new().eq("status", "Pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], "a");

        assert_eq!(store.delete_all("jobs").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileBackend::open(dir.path()).await.unwrap();
            store
                .create("jobs", json!({"id": "persist", "progress": 10}))
                .await
                .unwrap();
        }
        let store = FileBackend::open(dir.path()).await.unwrap();
        let record = store.find_by_id("jobs", "persist").await.unwrap().unwrap();
        assert_eq!(record["progress"], 10);
    }
}
