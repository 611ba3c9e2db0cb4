// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed small-object store.
//!
//! One table, one row per key:
//! ```sql
//! CREATE TABLE kv_entries (
//!   key TEXT PRIMARY KEY,
//!   value BLOB NOT NULL,
//!   updated_at INTEGER NOT NULL   -- epoch millis
//! )
//! ```
//!
//! An optional value ceiling makes this behave like a platform key/value
//! store with per-key size limits; oversized writes fail with
//! [`StorageError::TooLarge`] so the adapter can reroute them.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::traits::{LocalStore, StorageError};
use crate::preference::epoch_millis;

pub struct SqliteStore {
    pool: SqlitePool,
    max_value_bytes: Option<usize>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub async fn open(path: impl AsRef<Path>, max_value_bytes: Option<usize>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open {}: {}", path_str, e)))?;

        let store = Self { pool, max_value_bytes };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        info!(path = %path_str, ?max_value_bytes, "SQLite small-object store opened");
        Ok(store)
    }

    /// Private in-memory database (single connection, so every query sees it).
    pub async fn in_memory(max_value_bytes: Option<usize>) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let store = Self { pool, max_value_bytes };
        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to init schema: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn max_value_bytes(&self) -> Option<usize> {
        self.max_value_bytes
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StorageError::TooLarge {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }

        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(epoch_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr() instead of LIKE: keys may contain % and _
        let rows = sqlx::query("SELECT key FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(|e| StorageError::Backend(e.to_string())))
            .collect()
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }
}
