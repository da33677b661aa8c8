//! Table metadata registry.
//!
//! Metadata is produced ahead of time, either written by hand or dumped from
//! a live database with [`SchemaRegistry::introspect`], and loaded once at
//! startup. Nothing here is generated per request.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::driver::Driver;
use crate::error::{DbError, Result};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(default)]
    pub sql_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
}

const fn default_true() -> bool {
    true
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
        }
    }
}

fn default_primary_key() -> String {
    String::from("id")
}

/// Table metadata: name, primary key column and ordered fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub fields: Vec<FieldMeta>,
}

impl TableMeta {
    /// Metadata with only a name and an `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    /// Builds metadata from described columns. The first primary key column
    /// wins; a table without one keeps `id`.
    #[must_use]
    pub fn from_fields(name: impl Into<String>, fields: Vec<FieldMeta>) -> Self {
        let primary_key = fields
            .iter()
            .find(|f| f.primary_key)
            .map_or_else(default_primary_key, |f| f.name.clone());
        Self {
            name: name.into(),
            primary_key,
            fields,
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True when `name` is a known field, or when no fields are declared.
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.is_empty() || self.field(name).is_some() || name == self.primary_key
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// Mapping from table name to metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, Arc<TableMeta>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a registry document: `{"users": {"name": "users", ...}}`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] on malformed JSON and
    /// [`DbError::Config`] when a key and its table name disagree.
    pub fn from_json(text: &str) -> Result<Self> {
        let registry: Self = serde_json::from_str(text)?;
        for (key, meta) in &registry.tables {
            if key != &meta.name {
                return Err(DbError::Config(format!(
                    "schema entry `{key}` describes table `{}`",
                    meta.name
                )));
            }
        }
        Ok(registry)
    }

    /// Loads a registry file written by [`SchemaRegistry::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] or the errors of [`SchemaRegistry::from_json`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let registry = Self::from_json(&text)?;
        info!(path = %path.display(), tables = registry.len(), "Loaded schema registry");
        Ok(registry)
    }

    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Describes every table the driver reports.
    ///
    /// # Errors
    ///
    /// Propagates driver errors.
    pub async fn introspect<D: Driver>(driver: &mut D) -> Result<Self> {
        let mut registry = Self::new();
        for table in driver.tables().await? {
            let fields = driver.table_fields(&table).await?;
            debug!(table = %table, fields = fields.len(), "Described table");
            registry.insert(TableMeta::from_fields(table, fields));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, meta: TableMeta) {
        self.tables.insert(meta.name.clone(), Arc::new(meta));
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<Arc<TableMeta>> {
        self.tables.get(table).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
