use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::models::{CachedSnapshot, VehicleSnapshot};

/// Logical keys inside the key-value table. The snapshot blob and its
/// timestamp are stored separately so a partial write still leaves readable
/// data.
const KEY_SNAPSHOT: &str = "bus_locations_cache";
const KEY_LAST_UPDATE: &str = "last_update_timestamp";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(String),
    #[error("Cache encode error: {0}")]
    Encode(String),
}

/// Last-known snapshot store backing the offline fallback path. Writes
/// overwrite the previous snapshot; reads return `None` until the first
/// successful write or after an explicit clear.
#[derive(Clone)]
pub struct PersistentCache {
    pool: SqlitePool,
}

impl PersistentCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>, CacheError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CacheError::Store(e.to_string()))?;
        Ok(row.map(|(value,)| value))
    }

    async fn remove_item(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Store(e.to_string()))?;
        Ok(())
    }

    /// Overwrite the cached snapshot and stamp the write time.
    pub async fn save_snapshot(&self, snapshot: &VehicleSnapshot) -> Result<(), CacheError> {
        let encoded =
            serde_json::to_string(snapshot).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.set_item(KEY_SNAPSHOT, &encoded).await?;
        self.set_item(KEY_LAST_UPDATE, &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    /// The last cached snapshot, or `None` if nothing was ever written. A
    /// missing or unreadable timestamp does not invalidate the snapshot.
    pub async fn load_snapshot(&self) -> Result<Option<CachedSnapshot>, CacheError> {
        let data = match self.get_item(KEY_SNAPSHOT).await? {
            Some(data) => data,
            None => return Ok(None),
        };

        let snapshot: VehicleSnapshot =
            serde_json::from_str(&data).map_err(|e| CacheError::Encode(e.to_string()))?;

        let last_update = self
            .get_item(KEY_LAST_UPDATE)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Some(CachedSnapshot {
            data: snapshot,
            last_update,
        }))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.remove_item(KEY_SNAPSHOT).await?;
        self.remove_item(KEY_LAST_UPDATE).await?;
        Ok(())
    }
}
