//! Connection and cache configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, Result};

/// Database backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Sqlite,
    Mysql,
}

/// One logical database.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub driver: DriverKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Database name; the file path (or `:memory:`) for SQLite.
    pub name: String,
    /// Default per-statement deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Backend-specific options, passed through untouched.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl DbConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::Sqlite,
            host: None,
            port: None,
            user: None,
            password: None,
            name: path.into(),
            timeout_ms: None,
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .field("options", &self.options)
            .finish()
    }
}

/// Cache backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    File,
}

const fn default_expire_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,
    /// Root directory of the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Default entry lifetime; 0 keeps entries until flushed.
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            path: None,
            expire_secs: default_expire_secs(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn expire(&self) -> Option<Duration> {
        if self.expire_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.expire_secs))
        }
    }
}

/// Application-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub databases: BTreeMap<String, DbConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Schema registry file produced by `keel schema`.
    #[serde(default)]
    pub schema: Option<PathBuf>,
}

impl AppConfig {
    /// A configuration holding one database named `name`.
    pub fn single(name: impl Into<String>, db: DbConfig) -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(name.into(), db);
        Self {
            databases,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] on malformed JSON and
    /// [`DbError::Config`] for invalid settings.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`DbError::Io`] when the file cannot be read, or the errors
    /// of [`AppConfig::from_json_str`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&text)
    }

    /// # Errors
    ///
    /// Returns [`DbError::UnknownDatabase`].
    pub fn database(&self, name: &str) -> Result<&DbConfig> {
        self.databases
            .get(name)
            .ok_or_else(|| DbError::UnknownDatabase(name.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.cache.backend == CacheBackendKind::File && self.cache.path.is_none() {
            return Err(DbError::Config(String::from(
                "the file cache backend requires `cache.path`",
            )));
        }
        if let Some((name, _)) = self.databases.iter().find(|(_, db)| db.name.is_empty()) {
            return Err(DbError::Config(format!("database `{name}` has no name")));
        }
        Ok(())
    }
}
