//! SQLite-backed [`KeyValueStore`] for durable partition tracking.
//!
//! Each entry stores an absolute expiry in unix milliseconds. Expired rows
//! are invisible to reads immediately and are physically removed by
//! [`SqliteKvStore::purge_expired`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use ragsync_core::clock::{Clock, SystemClock};
use ragsync_core::kv::KeyValueStore;
use ragsync_core::{Result, SyncError};

use crate::sqlite_store::map_db_err;

pub struct SqliteKvStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

/// Live and expired entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvCounts {
    pub live: i64,
    pub expired: i64,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(self.now_ms())
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected())
    }

    pub async fn counts(&self) -> Result<KvCounts> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(expires_at > ?), 0) AS live, COALESCE(SUM(expires_at <= ?), 0) AS expired FROM kv_entries",
        )
        .bind(self.now_ms())
        .bind(self.now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(KvCounts {
            live: row.get("live"),
            expired: row.get("expired"),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| SyncError::InvalidInput(format!("ttl out of range: {:?}", ttl)))?;
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(self.now_ms().saturating_add(ttl_ms))
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn replace_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis())
            .map_err(|_| SyncError::InvalidInput(format!("ttl out of range: {:?}", ttl)))?;
        let now = self.now_ms();
        let result = sqlx::query(
            "UPDATE kv_entries SET value = ?, expires_at = ? WHERE key = ? AND expires_at > ?",
        )
        .bind(value)
        .bind(now.saturating_add(ttl_ms))
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(self.now_ms())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(self.now_ms())
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv_entries WHERE substr(key, 1, ?) = ? AND expires_at > ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(self.now_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use ragsync_core::clock::ManualClock;
    use tempfile::TempDir;

    async fn kv() -> (TempDir, Arc<ManualClock>, SqliteKvStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("kv.sqlite")).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = SqliteKvStore::with_clock(pool, clock.clone());
        (tmp, clock, store)
    }

    #[tokio::test]
    async fn test_set_overwrites_and_get() {
        let (_tmp, _clock, kv) = kv().await;
        kv.set_with_ttl("k", "v1", Duration::from_secs(60)).await.unwrap();
        kv.set_with_ttl("k", "v2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(kv.delete("k").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_only_touches_live_entries() {
        let (_tmp, clock, kv) = kv().await;
        let ttl = Duration::from_secs(60);
        assert!(!kv.replace_with_ttl("k", "v", ttl).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);

        kv.set_with_ttl("k", "v1", ttl).await.unwrap();
        assert!(kv.replace_with_ttl("k", "v2", ttl).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));

        clock.advance(chrono::Duration::seconds(61));
        assert!(!kv.replace_with_ttl("k", "v3", ttl).await.unwrap());
        assert_eq!(kv.counts().await.unwrap(), KvCounts { live: 0, expired: 1 });
    }

    #[tokio::test]
    async fn test_expiry_and_purge() {
        let (_tmp, clock, kv) = kv().await;
        kv.set_with_ttl("short", "x", Duration::from_secs(10)).await.unwrap();
        kv.set_with_ttl("long", "y", Duration::from_secs(3600)).await.unwrap();
        clock.advance(chrono::Duration::seconds(11));

        assert_eq!(kv.get("short").await.unwrap(), None);
        assert!(!kv.delete("short").await.unwrap());
        assert_eq!(kv.counts().await.unwrap(), KvCounts { live: 1, expired: 1 });
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert_eq!(kv.counts().await.unwrap(), KvCounts { live: 1, expired: 0 });
    }

    #[tokio::test]
    async fn test_scan_prefix_with_wildcard_chars() {
        let (_tmp, _clock, kv) = kv().await;
        let ttl = Duration::from_secs(60);
        kv.set_with_ttl("p:c_1:a", "1", ttl).await.unwrap();
        kv.set_with_ttl("p:cX1:a", "2", ttl).await.unwrap();
        kv.set_with_ttl("p:c_1:b", "3", ttl).await.unwrap();

        let found = kv.scan_prefix("p:c_1:").await.unwrap();
        assert_eq!(
            found,
            vec![
                ("p:c_1:a".to_string(), "1".to_string()),
                ("p:c_1:b".to_string(), "3".to_string())
            ]
        );
    }
}
