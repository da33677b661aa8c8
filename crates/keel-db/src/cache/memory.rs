//! Process-local cache backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::backend::{parse_counter, CacheBackend};
use crate::error::Result;

/// Size below which writes never trigger a sweep of expired entries.
const SWEEP_FLOOR: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, Entry>,
    /// Map size at which the next write sweeps expired entries.
    sweep_at: usize,
}

impl Default for Entries {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            sweep_at: SWEEP_FLOOR,
        }
    }
}

impl Entries {
    fn purge(&mut self, now: Instant) -> u64 {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        (before - self.map.len()) as u64
    }

    /// Inserts, sweeping expired entries whenever the map has doubled since
    /// the last sweep.
    fn insert(&mut self, key: &str, entry: Entry) {
        self.map.insert(key.to_string(), entry);
        if self.map.len() >= self.sweep_at {
            let purged = self.purge(Instant::now());
            self.sweep_at = (self.map.len() * 2).max(SWEEP_FLOOR);
            debug!(purged, live = self.map.len(), "Swept memory cache");
        }
    }
}

/// In-memory cache, expiring on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<Entries>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored entries, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().map.is_empty()
    }
}

impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> Result<()> {
        let expires_at = expire.map(|ttl| Instant::now() + ttl);
        self.entries().insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries().map.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, step: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries();
        let (current, expires_at) = match entries.map.get(key) {
            Some(entry) if entry.is_live(now) => {
                (parse_counter(key, &entry.value)?, entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current.saturating_add(step);
        entries.insert(
            key,
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries();
        let before = entries.map.len();
        entries.map.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.map.len()) as u64)
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.entries().purge(Instant::now()))
    }

    async fn flush(&self) -> Result<()> {
        self.entries().map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("short", "1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        cache.set("forever", "2", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("short").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(!cache.has("short").await.unwrap());
        assert!(cache.has("forever").await.unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_counters() {
        let cache = MemoryCache::new();
        assert_eq!(cache.increment("hits", 1).await.unwrap(), 1);
        assert_eq!(cache.increment("hits", 5).await.unwrap(), 6);
        assert_eq!(cache.decrement("hits", 2).await.unwrap(), 4);
        assert_eq!(cache.decrement("misses", 3).await.unwrap(), -3);

        cache.set("name", "\"Tom\"", None).await.unwrap();
        assert!(matches!(
            cache.increment("name", 1).await,
            Err(DbError::Cache(_))
        ));
    }

    #[tokio::test]
    async fn test_multi_and_flush() {
        let cache = MemoryCache::new();
        cache
            .multi_set(
                &[
                    (String::from("a"), String::from("1")),
                    (String::from("b"), String::from("2")),
                ],
                None,
            )
            .await
            .unwrap();
        let values = cache
            .multi_get(&[String::from("a"), String::from("x"), String::from("b")])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some(String::from("1")), None, Some(String::from("2"))]
        );

        cache.set("keel:t:1:rows", "[]", None).await.unwrap();
        cache.set("keel:t:1:count", "0", None).await.unwrap();
        cache.set("keel:t:2:rows", "[]", None).await.unwrap();
        assert_eq!(cache.delete_prefix("keel:t:1:").await.unwrap(), 2);
        assert!(cache.has("keel:t:2:rows").await.unwrap());

        cache.delete("a").await.unwrap();
        assert!(!cache.has("a").await.unwrap());
        cache.flush().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries() {
        let cache = MemoryCache::new();
        let ttl = Some(Duration::from_secs(1));
        for i in 0..SWEEP_FLOOR - 2 {
            cache.set(&format!("old:{i}"), "x", ttl).await.unwrap();
        }
        cache.set("kept", "y", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), SWEEP_FLOOR - 1);

        // Nothing is read back, yet the next write drops the dead entries.
        cache.set("new", "z", None).await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.set("short", "1", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.len(), 2);
    }
}
