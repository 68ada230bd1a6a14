//! SQLite backend implementation

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::backend::{ensure_id, merge_patch, Filter, StorageBackend, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
)
"#;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:spool.db" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:spool.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// SQLite storage backend
///
/// All collections share one `records` table; the document body is stored as
/// JSON text. Filtering happens after load, which is fine for job-sized
/// collections.
#[derive(Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend with default config
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let config = SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::new_with_config(config).await
    }

    /// Create a new SQLite backend with full configuration
    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        options = options.pragma("busy_timeout", config.busy_timeout_secs.to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");
        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(body: &str) -> Result<Value, StorageError> {
        Ok(serde_json::from_str(body)?)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn is_healthy(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn create(&self, collection: &str, record: Value) -> Result<Value, StorageError> {
        let (id, record) = ensure_id(record)?;
        let body = serde_json::to_string(&record)?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT OR IGNORE INTO records (collection, id, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(id.clone())
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(format!("{}/{}", collection, id)));
        }
        Ok(record)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query("SELECT body FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let body: String = row
                    .try_get("body")
                    .map_err(|e| StorageError::Query(e.to_string()))?;
                Ok(Some(Self::decode(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        let rows = sqlx::query("SELECT body FROM records WHERE collection = ? ORDER BY id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let body: String = row
                .try_get("body")
                .map_err(|e| StorageError::Query(e.to_string()))?;
            let record = Self::decode(&body)?;
            if filter.matches(&record) {
                out.push(record);
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let row = sqlx::query("SELECT body FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row
            .try_get("body")
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let mut record = Self::decode(&body)?;
        merge_patch(&mut record, patch)?;

        sqlx::query("UPDATE records SET body = ?, updated_at = ? WHERE collection = ? AND id = ?")
            .bind(serde_json::to_string(&record)?)
            .bind(chrono::Utc::now().timestamp())
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(Some(record))
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
