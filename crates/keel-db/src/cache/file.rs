//! One-file-per-key cache backend.
//!
//! An entry lives at `<root>/<h0h1>/<h2h3>/<sha256 hex>`. Its first line is
//! the unix expiry in seconds (`0` never expires), its second line the key as
//! a JSON string; the rest is the value.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::{parse_counter, CacheBackend};
use crate::error::Result;

static STAGING: AtomicU64 = AtomicU64::new(0);

/// Clones share the counter lock, so increments through any clone of one
/// cache are serialized.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    counters: Arc<Mutex<()>>,
}

struct Stored {
    expires_at: i64,
    key: String,
    value: String,
}

impl Stored {
    fn parse(content: &str) -> Option<Self> {
        let (header, rest) = content.split_once('\n')?;
        let (key, value) = rest.split_once('\n')?;
        Some(Self {
            expires_at: header.parse().ok()?,
            key: serde_json::from_str(key).ok()?,
            value: value.to_string(),
        })
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.root.join(&hash[..2]).join(&hash[2..4]).join(&hash)
    }

    fn expiry(expire: Option<Duration>) -> i64 {
        expire.map_or(0, |ttl| {
            let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            Utc::now().timestamp().saturating_add(secs.max(1))
        })
    }

    /// Reads a live entry. Expired and unreadable files are removed and read
    /// as misses.
    async fn read(&self, key: &str) -> Result<Option<Stored>> {
        let path = self.path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!(key, path = %path.display(), "Dropping undecodable cache entry");
                remove(&path).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let Some(stored) = Stored::parse(&content) else {
            warn!(key, path = %path.display(), "Dropping malformed cache entry");
            remove(&path).await?;
            return Ok(None);
        };
        if stored.is_expired(Utc::now().timestamp()) {
            remove(&path).await?;
            return Ok(None);
        }
        Ok(Some(stored))
    }

    /// Stages the entry under a name no other writer uses, then renames it
    /// into place.
    async fn write(&self, key: &str, value: &str, expires_at: i64) -> Result<()> {
        let path = self.path(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut staging = path.clone().into_os_string();
        staging.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            STAGING.fetch_add(1, Ordering::Relaxed)
        ));
        let staging = PathBuf::from(staging);
        let content = format!("{expires_at}\n{}\n{value}", serde_json::to_string(key)?);
        tokio::fs::write(&staging, content).await?;
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            remove(&staging).await?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Every entry file under the root. Staging files are skipped.
    async fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dirs = vec![(self.root.clone(), 0)];
        while let Some((dir, depth)) = dirs.pop() {
            let mut listing = match tokio::fs::read_dir(&dir).await {
                Ok(listing) => listing,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = listing.next_entry().await? {
                let path = entry.path();
                if depth < 2 {
                    dirs.push((path, depth + 1));
                } else if !entry.file_name().to_string_lossy().contains('.') {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// Removes expired and malformed entries, and with a `prefix` every
    /// entry whose key starts with it.
    async fn sweep(&self, prefix: Option<&str>) -> Result<u64> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        for path in self.entry_files().await? {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) if err.kind() == ErrorKind::InvalidData => String::new(),
                Err(err) => return Err(err.into()),
            };
            let stale = Stored::parse(&content).is_none_or(|stored| {
                stored.is_expired(now) || prefix.is_some_and(|p| stored.key.starts_with(p))
            });
            if stale {
                remove(&path).await?;
                removed += 1;
            }
        }
        debug!(root = %self.root.display(), prefix, removed, "Swept file cache");
        Ok(removed)
    }
}

async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

impl CacheBackend for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key).await?.map(|stored| stored.value))
    }

    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> Result<()> {
        self.write(key, value, Self::expiry(expire)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove(&self.path(key)).await
    }

    async fn increment(&self, key: &str, step: i64) -> Result<i64> {
        let _guard = self.counters.lock().await;
        let (current, expires_at) = match self.read(key).await? {
            Some(stored) => (parse_counter(key, &stored.value)?, stored.expires_at),
            None => (0, 0),
        };
        let next = current.saturating_add(step);
        self.write(key, &next.to_string(), expires_at).await?;
        Ok(next)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.sweep(Some(prefix)).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.sweep(None).await
    }

    async fn flush(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        cache.set("user:1", "{\"name\":\"Tom\"}\nline", None).await.unwrap();
        assert_eq!(
            cache.get("user:1").await.unwrap().as_deref(),
            Some("{\"name\":\"Tom\"}\nline")
        );
        assert!(cache.has("user:1").await.unwrap());

        let path = cache.path("user:1");
        let relative = path.strip_prefix(dir.path()).unwrap();
        assert_eq!(relative.components().count(), 3);
        let name = relative.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name.len(), 64);
        assert!(relative.starts_with(&name[..2]));

        cache.delete("user:1").await.unwrap();
        cache.delete("user:1").await.unwrap();
        assert_eq!(cache.get("user:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_and_corrupt_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        cache.write("old", "1", 1).await.unwrap();
        assert_eq!(cache.get("old").await.unwrap(), None);
        assert!(!cache.path("old").exists());

        cache.set("bad", "1", None).await.unwrap();
        tokio::fs::write(cache.path("bad"), "not a header").await.unwrap();
        assert_eq!(cache.get("bad").await.unwrap(), None);

        cache
            .set("fresh", "1", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.get("fresh").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_counters_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache"));

        assert_eq!(cache.increment("gen", 1).await.unwrap(), 1);
        assert_eq!(cache.increment("gen", 1).await.unwrap(), 2);
        assert_eq!(cache.decrement("gen", 5).await.unwrap(), -3);

        cache.flush().await.unwrap();
        assert!(!cache.root().exists());
        cache.flush().await.unwrap();
        assert_eq!(cache.get("gen").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_of_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.increment("keel:db:t:generation", 1).await?;
                cache.set("shared", &i.to_string(), None).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(
            cache.get("keel:db:t:generation").await.unwrap().as_deref(),
            Some("20")
        );
        assert!(cache.get("shared").await.unwrap().is_some());
        assert_eq!(cache.entry_files().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_prefix_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());

        cache.set("keel:db:t:1:rows", "[]", None).await.unwrap();
        cache.set("keel:db:t:1:count", "3", None).await.unwrap();
        cache.set("keel:db:t:2:rows", "[]", None).await.unwrap();
        cache.write("keel:db:u:0:rows", "[]", 1).await.unwrap();

        assert_eq!(cache.delete_prefix("keel:db:t:1:").await.unwrap(), 3);
        assert_eq!(cache.get("keel:db:t:1:rows").await.unwrap(), None);
        assert!(cache.has("keel:db:t:2:rows").await.unwrap());

        cache.write("keel:db:u:0:count", "1", 1).await.unwrap();
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.entry_files().await.unwrap().len(), 1);

        assert_eq!(FileCache::new(dir.path().join("none")).purge_expired().await.unwrap(), 0);
    }
}
