//! Storage backend trait and error types

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

/// Field holding a record's identity inside every stored document.
pub const ID_FIELD: &str = "id";

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Equality filter over top-level record fields.
///
/// All predicates must match. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: BTreeMap<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Check a record against every predicate
    pub fn matches(&self, record: &Value) -> bool {
        let Some(obj) = record.as_object() else {
            return self.fields.is_empty();
        };
        self.fields
            .iter()
            .all(|(field, expected)| obj.get(field) == Some(expected))
    }
}

/// Collection-scoped document storage (Object Safe)
///
/// Records are JSON objects carrying a string `id` field. "Not found" is an
/// ordinary outcome for lookups, updates and deletes, so those return
/// `Option`/`bool` rather than an error.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if backend is healthy
    async fn is_healthy(&self) -> bool;

    /// Insert a new record. A missing id is generated; an existing id is rejected.
    async fn create(&self, collection: &str, record: Value) -> Result<Value, StorageError>;

    /// Get a record by id
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError>;

    /// List records matching a filter
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError>;

    /// Merge `patch` into the top level of an existing record and return the result
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Option<Value>, StorageError>;

    /// Delete a record by id
    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError>;

    /// Delete every record in a collection, returning how many were removed
    async fn delete_all(&self, collection: &str) -> Result<u64, StorageError>;
}

/// Extension trait for typed access
#[async_trait]
pub trait StorageExt {
    async fn create_typed<T: Serialize + Send + Sync>(
        &self,
        collection: &str,
        value: &T,
    ) -> Result<(), StorageError>;
    async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StorageError>;
    async fn find_typed<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<T>, StorageError>;
    /// Replace the stored record, creating it if absent
    async fn upsert<T: Serialize + Send + Sync>(
        &self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: StorageBackend + ?Sized> StorageExt for S {
    async fn create_typed<T: Serialize + Send + Sync>(
        &self,
        collection: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_value(value)?;
        self.create(collection, json).await.map(|_| ())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.find_by_id(collection, id).await? {
            Some(json) => Ok(Some(serde_json::from_value(json)?)),
            None => Ok(None),
        }
    }

    async fn find_typed<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<T>, StorageError> {
        self.find(collection, filter)
            .await?
            .into_iter()
            .map(|json| serde_json::from_value(json).map_err(StorageError::from))
            .collect()
    }

    async fn upsert<T: Serialize + Send + Sync>(
        &self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_value(value)?;
        if self.update_by_id(collection, id, json.clone()).await?.is_some() {
            return Ok(());
        }
        match self.create(collection, json.clone()).await {
            Ok(_) => Ok(()),
            // Lost a race with another writer; the record exists now.
            Err(StorageError::AlreadyExists(_)) => {
                self.update_by_id(collection, id, json).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Make sure `record` is an object with a string id, generating one if absent.
pub(crate) fn ensure_id(mut record: Value) -> Result<(String, Value), StorageError> {
    let obj = record
        .as_object_mut()
        .ok_or_else(|| StorageError::InvalidRecord("record must be a JSON object".into()))?;
    let id = match obj.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Null) | None => {
            let id = uuid::Uuid::new_v4().to_string();
            obj.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            id
        }
        Some(other) => {
            return Err(StorageError::InvalidRecord(format!(
                "id must be a non-empty string, got {}",
                other
            )))
        }
    };
    Ok((id, record))
}

/// Merge the top-level fields of `patch` into `target`. The id never changes.
pub(crate) fn merge_patch(target: &mut Value, patch: Value) -> Result<(), StorageError> {
    let patch: Map<String, Value> = match patch {
        Value::Object(map) => map,
        _ => {
            return Err(StorageError::InvalidRecord(
                "patch must be a JSON object".into(),
            ))
        }
    };
    let obj = target
        .as_object_mut()
        .ok_or_else(|| StorageError::InvalidRecord("stored record is not an object".into()))?;
    for (field, value) in patch {
        if field == ID_FIELD {
            continue;
        }
        obj.insert(field, value);
    }
    Ok(())
}

/// In-memory storage backend (for testing)
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: tokio::sync::RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn create(&self, collection: &str, record: Value) -> Result<Value, StorageError> {
        let (id, record) = ensure_id(record)?;
        let mut data = self.data.write().await;
        let records = data.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(StorageError::AlreadyExists(format!("{}/{}", collection, id)));
        }
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(collection).and_then(|r| r.get(id)).cloned())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Option<Value>, StorageError> {
        let mut data = self.data.write().await;
        match data.get_mut(collection).and_then(|r| r.get_mut(id)) {
            Some(record) => {
                merge_patch(record, patch)?;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        Ok(data
            .get_mut(collection)
            .map(|r| r.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StorageError> {
        let mut data = self.data.write().await;
        Ok(data
            .remove(collection)
            .map(|r| r.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        id: String,
        name: String,
        value: i32,
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();

        let data = TestData {
            id: "t1".to_string(),
            name: "test".to_string(),
            value: 42,
        };

        backend.create_typed("tests", &data).await.unwrap();

        let retrieved: Option<TestData> = backend.get("tests", "t1").await.unwrap();
        assert_eq!(retrieved, Some(data));

        // Duplicate id is rejected
        let dup = backend.create("tests", json!({"id": "t1"})).await;
        assert!(matches!(dup, Err(StorageError::AlreadyExists(_))));

        // Other collections are isolated
        assert!(backend.find_by_id("other", "t1").await.unwrap().is_none());

        assert!(backend.delete_by_id("tests", "t1").await.unwrap());
        assert!(!backend.delete_by_id("tests", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_merges_and_keeps_id() {
        let backend = MemoryBackend::new();
        backend
            .create("jobs", json!({"id": "a", "status": "Pending", "progress": 0}))
            .await
            .unwrap();

        let updated = backend
            .update_by_id("jobs", "a", json!({"id": "b", "progress": 40}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["id"], "a");
        assert_eq!(updated["status"], "Pending");
        assert_eq!(updated["progress"], 40);

        let missing = backend
            .update_by_id("jobs", "nope", json!({"progress": 1}))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_generated_id_and_filter() {
        let backend = MemoryBackend::new();
        let created = backend
            .create("jobs", json!({"status": "Pending", "kind": "deploy"}))
            .await
            .unwrap();
        assert!(created["id"].as_str().is_some());
        backend
            .create("jobs", json!({"status": "Running", "kind": "deploy"}))
            .await
            .unwrap();

        let pending = backend
            .find("jobs", &Filter::new().eq("status", "Pending"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let all = backend.find("jobs", &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(backend.delete_all("jobs").await.unwrap(), 2);
        assert!(backend.find("jobs", &Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_creates_then_replaces() {
        let backend = MemoryBackend::new();
        let mut data = TestData {
            id: "u1".to_string(),
            name: "first".to_string(),
            value: 1,
        };
        backend.upsert("tests", "u1", &data).await.unwrap();
        data.value = 2;
        backend.upsert("tests", "u1", &data).await.unwrap();

        let stored: TestData = backend.get("tests", "u1").await.unwrap().unwrap();
        assert_eq!(stored.value, 2);
    }

    #[test]
    fn test_rejects_non_object_records() {
        assert!(matches!(
            ensure_id(json!([1, 2])),
            Err(StorageError::InvalidRecord(_))
        ));
        assert!(matches!(
            ensure_id(json!({"id": 7})),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
