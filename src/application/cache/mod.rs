//! TTL key/value cache (C1). Grounded on
//! `src/infrastructure/persistence/database.rs`'s WAL-mode sqlx wrapper and
//! `original_source/signals/cache.py::SQLiteCacheLayer`'s schema and
//! metrics surface.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub age_seconds: f64,
}

/// Storage-agnostic cache contract: any embedded KV with TTL semantics
/// satisfies it (per the spec's explicit re-architecture note). `set`
/// takes a pre-serialized byte string; the caller owns the serializer.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CacheEntry>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: f64) -> anyhow::Result<()>;
    async fn invalidate(&self, pattern: &str) -> anyhow::Result<u64>;
    async fn invalidate_key(&self, key: &str) -> anyhow::Result<()>;
    async fn invalidate_all(&self) -> anyhow::Result<()>;
    async fn cleanup_expired(&self) -> anyhow::Result<u64>;
    fn metrics(&self) -> CacheMetrics;
}

/// `sqlx`-backed TTL cache over a single `cache` table, matching the schema
/// in `spec.md` §6 exactly: `cache(key, value, expires_at, created_at,
/// hit_count)`, indexed on `expires_at`.
pub struct SqliteCache {
    pool: SqlitePool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl SqliteCache {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let cache = SqliteCache {
            pool,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        cache.init().await?;
        Ok(cache)
    }

    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at REAL NOT NULL,
                created_at REAL NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn now_epoch() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs_f64()
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        let now = Self::now_epoch();
        let row: Option<(Vec<u8>, f64, f64)> =
            sqlx::query_as("SELECT value, expires_at, created_at FROM cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value, expires_at, created_at)) if expires_at > now => {
                sqlx::query("UPDATE cache SET hit_count = hit_count + 1 WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheEntry { value, age_seconds: (now - created_at).max(0.0) }))
            }
            Some(_) => {
                // Expired but still physically present: a miss, indistinguishable
                // from a never-set key.
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: f64) -> anyhow::Result<()> {
        let now = Self::now_epoch();
        let expires_at = now + ttl_seconds;
        sqlx::query(
            r#"
            INSERT INTO cache (key, value, expires_at, created_at, hit_count)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at,
                hit_count = 0
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> anyhow::Result<u64> {
        // `%` wildcard semantics match SQL LIKE directly.
        let result = sqlx::query("DELETE FROM cache WHERE key LIKE ?")
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn invalidate_key(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM cache WHERE key = ?").bind(key).execute(&self.pool).await?;
        Ok(())
    }

    async fn invalidate_all(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> anyhow::Result<u64> {
        let now = Self::now_epoch();
        let result = sqlx::query("DELETE FROM cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Periodic sweep task; never required for correctness (expired rows are
/// already invisible to `get`), only for reclaiming disk space. Grounded on
/// `SQLiteCacheLayer.start_periodic_cleanup`.
pub async fn run_periodic_cleanup(cache: std::sync::Arc<SqliteCache>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(err) = cache.cleanup_expired().await {
            tracing::warn!(error = %err, "cache cleanup sweep failed");
        }
    }
}

/// Confidence decay for a cached read: `1 - 0.5*(age/ttl)` for a fresh
/// read, capped at 0.4 once the entry is older than 10 minutes.
pub fn decayed_confidence(age_seconds: f64, ttl_seconds: f64) -> f64 {
    let raw = if ttl_seconds > 0.0 {
        1.0 - 0.5 * (age_seconds / ttl_seconds)
    } else {
        1.0
    };
    let raw = raw.clamp(0.0, 1.0);
    if age_seconds > 600.0 {
        raw.min(0.4)
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_cache() -> SqliteCache {
        SqliteCache::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = test_cache().await;
        cache.set("k1", b"hello".to_vec(), 60.0).await.unwrap();
        let entry = cache.get("k1").await.unwrap().unwrap();
        assert_eq!(entry.value, b"hello");
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_not_an_error() {
        let cache = test_cache().await;
        cache.set("k1", b"hello".to_vec(), -1.0).await.unwrap();
        assert!(cache.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_pattern_matches_prefix_wildcard() {
        let cache = test_cache().await;
        cache.set("funding:BTC", b"a".to_vec(), 60.0).await.unwrap();
        cache.set("funding:ETH", b"b".to_vec(), 60.0).await.unwrap();
        cache.set("candles:BTC", b"c".to_vec(), 60.0).await.unwrap();
        let removed = cache.invalidate("funding:%").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("candles:BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn never_set_key_and_expired_key_are_indistinguishable() {
        let cache = test_cache().await;
        cache.set("k1", b"x".to_vec(), -1.0).await.unwrap();
        let expired = cache.get("k1").await.unwrap();
        let never_set = cache.get("k2").await.unwrap();
        assert!(expired.is_none() && never_set.is_none());
    }

    #[test]
    fn confidence_decays_over_age_and_caps_after_ten_minutes() {
        assert_eq!(decayed_confidence(0.0, 100.0), 1.0);
        assert!((decayed_confidence(50.0, 100.0) - 0.75).abs() < 1e-9);
        assert!(decayed_confidence(700.0, 100.0) <= 0.4);
    }
}
