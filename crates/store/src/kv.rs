//! Key-value store abstraction.
//!
//! The trait mirrors the small slice of Redis the runtime needs: string
//! get/set with optional TTL, delete, prefix scan, and list push/range for
//! ordered append (transcripts, commit indexes).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::AsyncCommands;

use clerk_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value; `ttl_secs = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// All keys matching a `prefix*` pattern.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append to the head of a list (newest first), optionally refreshing
    /// the list's TTL.
    async fn lpush(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Read a list range; `stop = -1` reads to the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Redis backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Redis-backed store using one multiplexed async connection.
#[derive(Clone)]
pub struct RedisKv {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisKv {
    /// Connect to Redis at the given URL (`redis://host:port/`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::Store(format!("redis open: {e}")))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| Error::Store(format!("redis connect: {e}")))?;
        tracing::info!(url = %url, "connected to redis");
        Ok(Self { conn })
    }
}

fn store_err(e: redis::RedisError) -> Error {
    Error::Store(e.to_string())
}

#[async_trait::async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl_secs {
            Some(ttl) => conn.set_ex(key, value, ttl).await.map_err(store_err),
            None => conn.set(key, value).await.map_err(store_err),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(store_err)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys(format!("{prefix}*")).await.map_err(store_err)
    }

    async fn lpush(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(key, value).await.map_err(store_err)?;
        if let Some(ttl) = ttl_secs {
            let _: bool = conn.expire(key, ttl as i64).await.map_err(store_err)?;
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(store_err)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct MemEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-memory store with TTL semantics, for tests and for degraded mode when
/// Redis is unreachable (change tracking still works within the process).
#[derive(Default)]
pub struct MemoryKv {
    strings: Mutex<HashMap<String, MemEntry>>,
    lists: Mutex<HashMap<String, (Vec<String>, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl_secs: Option<u64>) -> Option<Instant> {
        ttl_secs.map(|s| Instant::now() + Duration::from_secs(s))
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.strings.lock();
        match map.get(key) {
            Some(e) if e.expired() => {
                map.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.strings.lock().insert(
            key.to_owned(),
            MemEntry {
                value: value.to_owned(),
                expires_at: Self::deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.lock().remove(key);
        self.lists.lock().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut map = self.strings.lock();
        map.retain(|_, e| !e.expired());
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn lpush(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut lists = self.lists.lock();
        let entry = lists.entry(key.to_owned()).or_default();
        entry.0.insert(0, value.to_owned());
        if ttl_secs.is_some() {
            entry.1 = Self::deadline(ttl_secs);
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut lists = self.lists.lock();
        let Some((items, expires)) = lists.get(key) else {
            return Ok(Vec::new());
        };
        if expires.is_some_and(|t| Instant::now() >= t) {
            lists.remove(key);
            return Ok(Vec::new());
        }
        let len = items.len() as i64;
        let stop = if stop < 0 { len + stop } else { stop };
        let start = start.clamp(0, len);
        let stop = stop.clamp(-1, len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(items[start as usize..=stop as usize].to_vec())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_vanish() {
        let kv = MemoryKv::new();
        kv.set("gone", "x", Some(0)).await.unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);
        assert!(kv.scan("gone").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.set("chat:a", "1", None).await.unwrap();
        kv.set("chat:b", "2", None).await.unwrap();
        kv.set("commit:x", "3", None).await.unwrap();
        let keys = kv.scan("chat:").await.unwrap();
        assert_eq!(keys, vec!["chat:a", "chat:b"]);
    }

    #[tokio::test]
    async fn lists_are_newest_first() {
        let kv = MemoryKv::new();
        kv.lpush("l", "one", None).await.unwrap();
        kv.lpush("l", "two", None).await.unwrap();
        kv.lpush("l", "three", None).await.unwrap();

        let all = kv.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all, vec!["three", "two", "one"]);

        let first_two = kv.lrange("l", 0, 1).await.unwrap();
        assert_eq!(first_two, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn lrange_of_missing_key_is_empty() {
        let kv = MemoryKv::new();
        assert!(kv.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lrange_out_of_bounds_clamps() {
        let kv = MemoryKv::new();
        kv.lpush("l", "only", None).await.unwrap();
        assert_eq!(kv.lrange("l", 0, 99).await.unwrap(), vec!["only"]);
        assert!(kv.lrange("l", 5, 9).await.unwrap().is_empty());
    }
}
