//! Named-blob key-value storage

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::Database;
use crate::error::Result;
use crate::util::lock;

/// Blob names written by the sync engine
pub mod keys {
    pub const ENTITY_CACHE: &str = "entity_cache";
    pub const PENDING_OPERATIONS: &str = "pending_operations";
    pub const LAST_SYNC_AT: &str = "last_sync_at";
}

/// Durable key-value store that survives process restarts
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Load a blob, `None` when it was never written
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a blob
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a blob if present
    async fn remove(&self, key: &str) -> Result<()>;

    /// Insert or replace several blobs together.
    ///
    /// Stores that can commit atomically override this; the default writes
    /// one blob at a time.
    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }
}

/// libSQL implementation of `KvStore`
pub struct LibSqlKvStore {
    database: Database,
}

impl LibSqlKvStore {
    /// Create a store on an already-migrated database
    pub const fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl KvStore for LibSqlKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .database
            .connection()
            .query("SELECT value FROM sync_blobs WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.database
            .connection()
            .execute(
                "INSERT OR REPLACE INTO sync_blobs (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![key, value, now],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.database
            .connection()
            .execute("DELETE FROM sync_blobs WHERE key = ?", [key])
            .await?;
        Ok(())
    }

    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let conn = self.database.connection();
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute("BEGIN TRANSACTION", ()).await?;
        for (key, value) in entries {
            if let Err(e) = conn
                .execute(
                    "INSERT OR REPLACE INTO sync_blobs (key, value, updated_at) VALUES (?, ?, ?)",
                    libsql::params![*key, *value, now],
                )
                .await
            {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }
        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-process `KvStore` for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKvStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.blobs).get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.blobs).insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        lock(&self.blobs).remove(key);
        Ok(())
    }

    async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut blobs = lock(&self.blobs);
        for (key, value) in entries {
            blobs.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup() -> LibSqlKvStore {
        LibSqlKvStore::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_blob_is_none() {
        let store = setup().await;
        assert_eq!(store.get(keys::PENDING_OPERATIONS).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_replaces_and_remove_deletes() {
        let store = setup().await;

        store.put(keys::LAST_SYNC_AT, "first").await.unwrap();
        store.put(keys::LAST_SYNC_AT, "second").await.unwrap();
        assert_eq!(
            store.get(keys::LAST_SYNC_AT).await.unwrap().as_deref(),
            Some("second")
        );

        store.remove(keys::LAST_SYNC_AT).await.unwrap();
        assert_eq!(store.get(keys::LAST_SYNC_AT).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blobs_survive_reopen() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("pawtrack.db");

        {
            let store = LibSqlKvStore::new(Database::open(&db_path).await.unwrap());
            store.put(keys::ENTITY_CACHE, "{}").await.unwrap();
        }

        let reopened = LibSqlKvStore::new(Database::open(&db_path).await.unwrap());
        assert_eq!(
            reopened.get(keys::ENTITY_CACHE).await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_many_writes_every_blob() {
        let store = setup().await;
        store.put(keys::ENTITY_CACHE, "old cache").await.unwrap();

        store
            .put_many(&[
                (keys::PENDING_OPERATIONS, "log"),
                (keys::ENTITY_CACHE, "cache"),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.get(keys::PENDING_OPERATIONS).await.unwrap().as_deref(),
            Some("log")
        );
        assert_eq!(
            store.get(keys::ENTITY_CACHE).await.unwrap().as_deref(),
            Some("cache")
        );

        // The connection is usable again once the transaction committed
        store.put(keys::LAST_SYNC_AT, "now").await.unwrap();
        assert_eq!(
            store.get(keys::LAST_SYNC_AT).await.unwrap().as_deref(),
            Some("now")
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryKvStore::new();
        store.put("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.put_many(&[("a", "2"), ("b", "3")]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("3"));
    }
}
