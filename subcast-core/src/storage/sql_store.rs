//! SQLite-backed attribute store
//!
//! Lets several worker processes share one actor's callback state. Deleted
//! attributes are kept as tombstones (`value IS NULL`) so a key's version
//! keeps increasing across delete and re-create, which keeps stale
//! compare-and-set writers from succeeding.
//!
//! Uses connection pooling; every call runs on the blocking pool.

use super::errors::{StoreError, StoreResult};
use super::traits::{AttributeStore, VersionedAttribute};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS attributes (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT,
        version INTEGER NOT NULL,
        PRIMARY KEY (bucket, key)
    );
"#;

/// SQLite-backed attribute store
#[derive(Clone)]
pub struct SqlAttributeStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqlAttributeStore {
    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)
        });
        let pool = Pool::builder().max_size(pool_size).build(manager)?;

        let store = Self { pool: Arc::new(pool) };
        store.init_schema()?;
        Ok(store)
    }

    /// Private in-memory database, one connection
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let store = Self { pool: Arc::new(pool) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` with a pooled connection on the blocking thread pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("Task join error: {}", e)))?
    }
}

fn to_text(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_text(text: &str) -> StoreResult<Value> {
    serde_json::from_str(text).map_err(|e| StoreError::Deserialization(e.to_string()))
}

#[async_trait]
impl AttributeStore for SqlAttributeStore {
    async fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<VersionedAttribute>> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, version FROM attributes
                     WHERE bucket = ?1 AND key = ?2 AND value IS NOT NULL",
                    params![bucket, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            row.map(|(text, version)| -> StoreResult<VersionedAttribute> {
                Ok(VersionedAttribute { value: from_text(&text)?, version: version as u64 })
            })
            .transpose()
        })
        .await
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> StoreResult<u64> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        let text = to_text(&value)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO attributes (bucket, key, value, version) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(bucket, key) DO UPDATE SET
                     value = excluded.value,
                     version = attributes.version + 1",
                params![bucket, key, text],
            )?;
            let version: i64 = tx.query_row(
                "SELECT version FROM attributes WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(version as u64)
        })
        .await
    }

    async fn compare_and_set(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> StoreResult<bool> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        let text = to_text(&value)?;
        self.with_conn(move |conn| {
            let changed = match expected {
                None => conn.execute(
                    "INSERT INTO attributes (bucket, key, value, version) VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(bucket, key) DO UPDATE SET
                         value = excluded.value,
                         version = attributes.version + 1
                     WHERE attributes.value IS NULL",
                    params![bucket, key, text],
                )?,
                Some(version) => conn.execute(
                    "UPDATE attributes SET value = ?3, version = version + 1
                     WHERE bucket = ?1 AND key = ?2 AND version = ?4 AND value IS NOT NULL",
                    params![bucket, key, text, version as i64],
                )?,
            };
            Ok(changed == 1)
        })
        .await
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let (bucket, key) = (bucket.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE attributes SET value = NULL
                 WHERE bucket = ?1 AND key = ?2 AND value IS NOT NULL",
                params![bucket, key],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list(&self, bucket: &str) -> StoreResult<Vec<(String, VersionedAttribute)>> {
        let bucket = bucket.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, version FROM attributes
                 WHERE bucket = ?1 AND value IS NOT NULL ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![bucket], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(key, text, version)| {
                    Ok((key, VersionedAttribute { value: from_text(&text)?, version: version as u64 }))
                })
                .collect::<StoreResult<Vec<_>>>()
        })
        .await
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> StoreResult<usize> {
        let (bucket, prefix) = (bucket.to_string(), prefix.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE attributes SET value = NULL
                 WHERE bucket = ?1 AND substr(key, 1, length(?2)) = ?2 AND value IS NOT NULL",
                params![bucket, prefix],
            )?;
            Ok(changed)
        })
        .await
    }
}
