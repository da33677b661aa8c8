//! Application wiring: configuration, schema and cache in one place.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheProxy, CacheStore, Cacheable};
use crate::config::{AppConfig, DriverKind};
use crate::driver::SqliteDriver;
use crate::error::{DbError, Result};
use crate::schema::{SchemaRegistry, TableMeta};
use crate::table::Table;
use crate::tuple::Tuple;

/// Hands out drivers, builders, records and cache proxies.
///
/// Cloning is cheap; clones share the schema registry and the cache store.
#[derive(Debug, Clone)]
pub struct Container {
    config: Arc<AppConfig>,
    schema: Arc<SchemaRegistry>,
    cache: Arc<CacheStore>,
}

impl Container {
    /// # Errors
    ///
    /// Returns [`DbError::Config`] when the cache backend is misconfigured.
    pub fn new(config: AppConfig, schema: SchemaRegistry) -> Result<Self> {
        let cache = CacheStore::from_config(&config.cache)?;
        Ok(Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            cache: Arc::new(cache),
        })
    }

    /// Reads the configuration at `path` and the schema registry it names.
    /// A relative schema path resolves against the configuration's directory.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = AppConfig::load(path).await?;
        let schema = match &config.schema {
            Some(schema_path) => {
                let resolved = match path.parent() {
                    Some(dir) if schema_path.is_relative() => dir.join(schema_path),
                    _ => schema_path.clone(),
                };
                SchemaRegistry::load(resolved).await?
            }
            None => SchemaRegistry::new(),
        };
        info!(
            config = %path.display(),
            databases = config.databases.len(),
            tables = schema.len(),
            "Container loaded"
        );
        Self::new(config, schema)
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// A new, not yet connected driver for the logical database `db`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownDatabase`] or [`DbError::UnsupportedDriver`].
    pub fn driver(&self, db: &str) -> Result<SqliteDriver> {
        let config = self.config.database(db)?;
        match config.driver {
            DriverKind::Sqlite => SqliteDriver::new(db, config.clone()),
            DriverKind::Mysql => Err(DbError::UnsupportedDriver(String::from("mysql"))),
        }
    }

    fn meta(&self, db: &str, table: &str) -> Result<Arc<TableMeta>> {
        self.config.database(db)?;
        self.schema
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`DbError::UnknownDatabase`] or [`DbError::UnknownTable`].
    pub fn table(&self, db: &str, table: &str) -> Result<Table> {
        Ok(Table::new(db, self.meta(db, table)?))
    }

    /// An empty record of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownDatabase`] or [`DbError::UnknownTable`].
    pub fn tuple(&self, db: &str, table: &str) -> Result<Tuple> {
        Ok(Tuple::new(db, self.meta(db, table)?))
    }

    /// Wraps `target` in a proxy over the shared store, expiring entries
    /// after the configured default.
    pub fn cached<T: Cacheable>(&self, target: T) -> CacheProxy<T> {
        CacheProxy::new(target, Arc::clone(&self.cache)).with_expire(self.config.cache.expire())
    }
}
