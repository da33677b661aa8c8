//! Backend selected by configuration.

use std::time::Duration;

use super::backend::CacheBackend;
use super::file::FileCache;
use super::memory::MemoryCache;
use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::{DbError, Result};

/// The configured cache backend.
#[derive(Debug)]
pub enum CacheStore {
    Memory(MemoryCache),
    File(FileCache),
}

impl CacheStore {
    /// # Errors
    ///
    /// Returns [`DbError::Config`] when the file backend has no directory.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match config.backend {
            CacheBackendKind::Memory => Ok(Self::Memory(MemoryCache::new())),
            CacheBackendKind::File => config
                .path
                .as_ref()
                .map(|path| Self::File(FileCache::new(path)))
                .ok_or_else(|| {
                    DbError::Config(String::from("the file cache backend requires `cache.path`"))
                }),
        }
    }
}

impl CacheBackend for CacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Memory(cache) => cache.get(key).await,
            Self::File(cache) => cache.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.set(key, value, expire).await,
            Self::File(cache) => cache.set(key, value, expire).await,
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(cache) => cache.has(key).await,
            Self::File(cache) => cache.has(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.delete(key).await,
            Self::File(cache) => cache.delete(key).await,
        }
    }

    async fn increment(&self, key: &str, step: i64) -> Result<i64> {
        match self {
            Self::Memory(cache) => cache.increment(key, step).await,
            Self::File(cache) => cache.increment(key, step).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        match self {
            Self::Memory(cache) => cache.delete_prefix(prefix).await,
            Self::File(cache) => cache.delete_prefix(prefix).await,
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        match self {
            Self::Memory(cache) => cache.purge_expired().await,
            Self::File(cache) => cache.purge_expired().await,
        }
    }

    async fn flush(&self) -> Result<()> {
        match self {
            Self::Memory(cache) => cache.flush().await,
            Self::File(cache) => cache.flush().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config() {
        let store = CacheStore::from_config(&CacheConfig::default()).unwrap();
        assert!(matches!(store, CacheStore::Memory(_)));
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        let dir = tempfile::tempdir().unwrap();
        let file = CacheConfig {
            backend: CacheBackendKind::File,
            path: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let store = CacheStore::from_config(&file).unwrap();
        assert!(matches!(store, CacheStore::File(_)));
        assert_eq!(store.increment("n", 2).await.unwrap(), 2);
        store.set("keel:a:1", "x", None).await.unwrap();
        assert_eq!(store.delete_prefix("keel:a:").await.unwrap(), 1);
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("2"));

        let missing = CacheConfig {
            backend: CacheBackendKind::File,
            ..CacheConfig::default()
        };
        assert!(matches!(
            CacheStore::from_config(&missing),
            Err(DbError::Config(_))
        ));
    }
}
