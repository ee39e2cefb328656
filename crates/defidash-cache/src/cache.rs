use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use defidash_core::time::to_db;
use rusqlite::{Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    db::init_db,
    error::{CacheError, Result},
};

/// Database-backed cache shared by request handlers and jobs.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Cache {
    conn: Arc<Mutex<Connection>>,
}

impl Cache {
    /// Wrap a connection, creating the `cache` table if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Return the value stored under `key`, or `None` if it is absent or expired.
    #[instrument(skip(self))]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key, Utc::now())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    #[instrument(skip(self, value))]
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_raw(key, &bytes, ttl)
    }

    /// Remove `key`. Returns whether a row was deleted.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let n = self.lock().execute("DELETE FROM cache WHERE id = ?1", [key])?;
        Ok(n > 0)
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// The returned value is decoded from the stored bytes, so it has exactly
    /// the shape a later [`Cache::get`] would produce.
    ///
    /// There is no locking between callers. When several callers miss the
    /// same key concurrently, each of them runs `fallback`.
    pub async fn get_or_set_with<T, F, Fut>(&self, key: &str, ttl: Duration, fallback: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.try_get_or_set_with(key, ttl, move || async move { Ok::<_, CacheError>(fallback().await) })
            .await
    }

    /// Fallible variant of [`Cache::get_or_set_with`]. A fallback error is
    /// returned as-is and nothing is stored.
    pub async fn try_get_or_set_with<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fallback: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(hit) = self.get(key)? {
            debug!(key, "cache hit");
            return Ok(hit);
        }

        debug!(key, "cache miss, computing value");
        let value = fallback().await?;
        let bytes = serde_json::to_vec(&value).map_err(CacheError::from)?;
        self.set_raw(key, &bytes, ttl)?;
        Ok(serde_json::from_slice(&bytes).map_err(CacheError::from)?)
    }

    /// Delete every row whose expiry is at or before `now`.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self
            .lock()
            .execute("DELETE FROM cache WHERE expires <= ?1", [to_db(now)])?;
        if n > 0 {
            info!(count = n, "expired cache entries purged");
        }
        Ok(n)
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(Utc::now())
    }

    /// Delete every row, expired or not.
    pub fn clear(&self) -> Result<usize> {
        let n = self.lock().execute("DELETE FROM cache", [])?;
        info!(count = n, "cache cleared");
        Ok(n)
    }

    /// Total rows on disk, including expired ones not yet purged.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // --- private helpers ---------------------------------------------------

    fn get_raw(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Vec<u8>>> {
        let value = self
            .lock()
            .query_row(
                "SELECT value FROM cache WHERE id = ?1 AND expires > ?2",
                rusqlite::params![key, to_db(now)],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_raw(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<()> {
        let expires = expiry(Utc::now(), ttl)?;
        self.lock().execute(
            "INSERT INTO cache (id, value, expires) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET value = excluded.value, expires = excluded.expires",
            rusqlite::params![key, bytes, to_db(expires)],
        )?;
        Ok(())
    }

    // The connection holds no in-memory state a panic could corrupt; every
    // statement is its own transaction.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::InvalidTtl(e.to_string()))?;
    now.checked_add_signed(ttl)
        .ok_or_else(|| CacheError::InvalidTtl(format!("{ttl} overflows the expiry timestamp")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PoolStats {
        tvl: u64,
        apr: f64,
        symbol: String,
    }

    fn cache() -> Cache {
        Cache::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn stats() -> PoolStats {
        PoolStats {
            tvl: 1_250_000,
            apr: 12.5,
            symbol: "WETH".to_string(),
        }
    }

    #[test]
    fn get_returns_unexpired_value_unchanged() {
        let cache = cache();
        cache.set("pool:1", &stats(), Duration::from_secs(60)).unwrap();

        let hit: Option<PoolStats> = cache.get("pool:1").unwrap();
        assert_eq!(hit, Some(stats()));
    }

    #[test]
    fn get_on_expired_key_is_a_miss() {
        let cache = cache();
        cache.set("pool:1", &stats(), Duration::ZERO).unwrap();

        let hit: Option<PoolStats> = cache.get("pool:1").unwrap();
        assert!(hit.is_none());
        // The row is inert, not gone.
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn set_overwrites_value_and_expiry() {
        let cache = cache();
        cache.set("k", &1u32, Duration::ZERO).unwrap();
        cache.set("k", &2u32, Duration::from_secs(60)).unwrap();

        assert_eq!(cache.get::<u32>("k").unwrap(), Some(2));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn delete_removes_the_row() {
        let cache = cache();
        cache.set("k", "v", Duration::from_secs(60)).unwrap();

        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
        assert_eq!(cache.get::<String>("k").unwrap(), None);
    }

    #[test]
    fn decoding_into_the_wrong_shape_is_an_error() {
        let cache = cache();
        cache.set("k", "not a number", Duration::from_secs(60)).unwrap();

        assert!(matches!(cache.get::<u64>("k"), Err(CacheError::Serialization(_))));
    }

    #[test]
    fn purge_only_removes_expired_rows() {
        let cache = cache();
        cache.set("stale", &1, Duration::ZERO).unwrap();
        cache.set("fresh", &2, Duration::from_secs(3600)).unwrap();

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get::<i32>("fresh").unwrap(), Some(2));

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn fallback_runs_once_while_entry_is_fresh() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        let first: PoolStats = cache
            .get_or_set_with("pool:1", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                stats()
            })
            .await
            .unwrap();
        let second: PoolStats = cache
            .get_or_set_with("pool:1", Duration::from_secs(60), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                stats()
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn computed_value_is_returned_in_stored_shape() {
        let cache = cache();

        // A map serializes as a JSON object; reading it back as Value shows
        // the caller gets the stored representation, not the input type.
        let value: serde_json::Value = cache
            .get_or_set_with("shape", Duration::from_secs(60), || async {
                serde_json::json!({ "tvl": 10, "symbol": "ARB" })
            })
            .await
            .unwrap();
        let stored: Option<serde_json::Value> = cache.get("shape").unwrap();
        assert_eq!(Some(value), stored);
    }

    #[tokio::test]
    async fn failing_fallback_stores_nothing() {
        let cache = cache();

        let result: std::result::Result<u32, CacheError> = cache
            .try_get_or_set_with("k", Duration::from_secs(60), || async {
                Err(CacheError::InvalidTtl("boom".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let cache = cache();
        let err = cache.set("k", &1, Duration::MAX).unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl(_)));
    }
}
