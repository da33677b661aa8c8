//! Key/value store contract used by the cache proxy.

use std::time::Duration;

use crate::error::Result;

/// A string key/value store with per-entry expiry.
///
/// Values are opaque text; the proxy stores JSON. Each call is atomic per
/// key. Nothing is promised across keys.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync {
    /// Returns the live value under `key`. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Stores `value`; `None` keeps it until deleted or flushed.
    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> Result<()>;

    async fn multi_set(&self, values: &[(String, String)], expire: Option<Duration>) -> Result<()> {
        for (key, value) in values {
            self.set(key, value, expire).await?;
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()>;

    /// Adds `step` to an integer entry and returns the new value. A missing
    /// or expired entry starts from zero and never expires.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DbError::Cache`] when the entry is not an integer.
    async fn increment(&self, key: &str, step: i64) -> Result<i64>;

    async fn decrement(&self, key: &str, step: i64) -> Result<i64> {
        self.increment(key, step.saturating_neg()).await
    }

    /// Drops every entry whose key starts with `prefix` and returns how many
    /// were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Drops every expired entry and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;

    /// Drops every entry.
    async fn flush(&self) -> Result<()>;
}

/// Parses the integer payload of an entry for `increment`.
pub(crate) fn parse_counter(key: &str, value: &str) -> Result<i64> {
    value.trim().parse().map_err(|_| {
        crate::error::DbError::Cache(format!("entry `{key}` does not hold an integer"))
    })
}
