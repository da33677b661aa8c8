//! Single-row active record.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use keel_sql_core::{Assignment, Condition, QueryState, SqlValue, ToSqlValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::Driver;
use crate::error::{DbError, Result};
use crate::row::Row;
use crate::schema::TableMeta;

/// How [`Tuple::load`] identifies its row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Lookup {
    /// Primary key value.
    Key(SqlValue),
    /// `field = value`.
    Field(String, SqlValue),
    /// Several `field = value` pairs, ANDed.
    Fields(Vec<(String, SqlValue)>),
    /// Trusted WHERE fragment.
    Raw(String),
}

impl Lookup {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw(sql.into())
    }
}

impl From<i64> for Lookup {
    fn from(id: i64) -> Self {
        Self::Key(SqlValue::Int(id))
    }
}

impl From<i32> for Lookup {
    fn from(id: i32) -> Self {
        Self::Key(SqlValue::Int(i64::from(id)))
    }
}

impl From<SqlValue> for Lookup {
    fn from(id: SqlValue) -> Self {
        Self::Key(id)
    }
}

impl<V: ToSqlValue> From<(&str, V)> for Lookup {
    fn from((field, value): (&str, V)) -> Self {
        Self::Field(field.to_string(), value.to_sql_value())
    }
}

impl<V: ToSqlValue> From<Vec<(&str, V)>> for Lookup {
    fn from(pairs: Vec<(&str, V)>) -> Self {
        Self::Fields(
            pairs
                .into_iter()
                .map(|(field, value)| (field.to_string(), value.to_sql_value()))
                .collect(),
        )
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(value) => write!(f, "primary key {value}"),
            Self::Field(field, value) => write!(f, "{field} = {value}"),
            Self::Fields(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(field, value)| format!("{field} = {value}"))
                    .collect();
                f.write_str(&parts.join(" AND "))
            }
            Self::Raw(sql) => f.write_str(sql),
        }
    }
}

/// One row of one table.
///
/// Only the row's own fields are exported; the database name and table
/// metadata stay internal.
#[derive(Debug, Clone)]
pub struct Tuple {
    db: String,
    meta: Arc<TableMeta>,
    values: Row,
    explicit_nulls: BTreeSet<String>,
}

impl Tuple {
    pub fn new(db: impl Into<String>, meta: Arc<TableMeta>) -> Self {
        Self {
            db: db.into(),
            meta,
            values: Row::new(),
            explicit_nulls: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    #[must_use]
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.meta.primary_key
    }

    /// Current primary key value, if set.
    #[must_use]
    pub fn key(&self) -> Option<&SqlValue> {
        self.values.get(&self.meta.primary_key)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&SqlValue> {
        self.values.get(field)
    }

    /// # Errors
    ///
    /// Returns [`DbError::UnknownField`] for fields the table does not have.
    pub fn set(&mut self, field: &str, value: impl ToSqlValue) -> Result<&mut Self> {
        self.check_field(field)?;
        self.explicit_nulls.remove(field);
        self.values.set(field, value);
        Ok(self)
    }

    /// Marks `field` to be written as SQL NULL by the next [`Tuple::save`].
    /// A plain null value is skipped on update instead.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnknownField`] for fields the table does not have.
    pub fn set_null(&mut self, field: &str) -> Result<&mut Self> {
        self.check_field(field)?;
        self.values.set(field, SqlValue::Null);
        self.explicit_nulls.insert(field.to_string());
        Ok(self)
    }

    fn check_field(&self, field: &str) -> Result<()> {
        if self.meta.has_field(field) {
            Ok(())
        } else {
            Err(DbError::UnknownField {
                table: self.meta.name.clone(),
                field: field.to_string(),
            })
        }
    }

    /// Copies the source's non-null values for fields this table has;
    /// everything else in `source` is ignored.
    pub fn bind(&mut self, source: &Row) -> &mut Self {
        for (field, value) in source.iter() {
            if !value.is_null() && self.meta.has_field(field) {
                self.explicit_nulls.remove(field);
                self.values.set(field, value.clone());
            }
        }
        self
    }

    /// Takes every known field of a fetched row, NULLs included.
    pub(crate) fn fill(&mut self, row: &Row) -> &mut Self {
        self.explicit_nulls.clear();
        for (field, value) in row.iter() {
            if self.meta.has_field(field) {
                self.values.set(field, value.clone());
            }
        }
        self
    }

    /// [`Tuple::bind`] from any map-shaped serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] when `source` is not map-shaped.
    pub fn bind_from<S: Serialize>(&mut self, source: &S) -> Result<&mut Self> {
        let row = Row::from_serialize(source)?;
        Ok(self.bind(&row))
    }

    fn lookup_state(&self, lookup: &Lookup) -> Result<QueryState> {
        let mut state = QueryState::new(self.meta.name.clone());
        match lookup {
            Lookup::Key(id) => {
                state.where_eq(self.meta.primary_key.clone(), id);
            }
            Lookup::Field(field, value) => {
                state.where_eq(field.clone(), value);
            }
            Lookup::Fields(pairs) => {
                if pairs.is_empty() {
                    return Err(DbError::MissingCondition {
                        table: self.meta.name.clone(),
                        primary_key: self.meta.primary_key.clone(),
                    });
                }
                for (field, value) in pairs {
                    state.filter(Condition::eq(field.clone(), value));
                }
            }
            Lookup::Raw(sql) => {
                state.where_raw(sql.clone());
            }
        }
        state.limit(1);
        Ok(state)
    }

    /// Fetches the row matching `lookup` without binding it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when nothing matches.
    pub async fn find<D: Driver>(&self, driver: &mut D, lookup: impl Into<Lookup>) -> Result<Row> {
        let lookup = lookup.into();
        let state = self.lookup_state(&lookup)?;
        let dialect = driver.dialect();
        let fields = if self.meta.fields.is_empty() {
            None
        } else {
            let quoted: Vec<String> = self
                .meta
                .field_names()
                .map(|f| dialect.quote_identifier(f))
                .collect();
            Some(quoted.join(", "))
        };
        let prepared = state.select_sql(dialect, fields.as_deref())?;
        driver
            .row(&prepared.sql, &prepared.binds)
            .await?
            .ok_or_else(|| DbError::NotFound {
                table: self.meta.name.clone(),
                lookup: lookup.to_string(),
            })
    }

    /// Loads the row matching `lookup` into this record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when nothing matches.
    pub async fn load<D: Driver>(
        &mut self,
        driver: &mut D,
        lookup: impl Into<Lookup>,
    ) -> Result<&mut Self> {
        let row = self.find(driver, lookup).await?;
        Ok(self.fill(&row))
    }

    /// Inserts when the primary key is unset (back-filling the generated
    /// key), otherwise updates by primary key.
    ///
    /// Inserts leave out null fields so column defaults apply; fields marked
    /// with [`Tuple::set_null`] are written as NULL either way.
    pub async fn save<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let primary_key = self.meta.primary_key.clone();
        let unset = self.key().is_none_or(SqlValue::is_unset_key);

        if unset {
            let record: Row = self
                .values
                .iter()
                .filter(|(field, value)| {
                    *field != primary_key
                        && (!value.is_null() || self.explicit_nulls.contains(*field))
                })
                .map(|(field, value)| (field.to_string(), value.clone()))
                .collect();
            driver.insert(&self.meta.name, &record).await?;
            if let Some(id) = driver.last_insert_id() {
                self.values.set(primary_key, id);
            }
            debug!(db = %self.db, table = %self.meta.name, key = ?self.key(), "Inserted record");
        } else {
            let nulls: Vec<String> = self.explicit_nulls.iter().cloned().collect();
            driver
                .update(&self.meta.name, &self.values, &primary_key, &nulls)
                .await?;
            debug!(db = %self.db, table = %self.meta.name, key = ?self.key(), "Updated record");
        }
        self.explicit_nulls.clear();
        Ok(self)
    }

    /// Deletes by `id`, or by this record's key when `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::MissingKey`] when neither is available.
    pub async fn delete<D: Driver>(
        &mut self,
        driver: &mut D,
        id: Option<SqlValue>,
    ) -> Result<&mut Self> {
        let id = id
            .or_else(|| self.key().cloned())
            .filter(|v| !v.is_null())
            .ok_or_else(|| DbError::MissingKey {
                table: self.meta.name.clone(),
            })?;
        let mut state = QueryState::new(self.meta.name.clone());
        state.where_eq(self.meta.primary_key.clone(), id);
        let prepared = state.delete_sql(driver.dialect())?;
        driver.execute(Some(&prepared.sql), &prepared.binds).await?;
        Ok(self)
    }

    /// `field = field + step` for this record in one statement. The local
    /// value is left as loaded.
    pub async fn increment<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        self.adjust(driver, Assignment::Increment(field.to_string(), step))
            .await
    }

    /// `field = field - step` for this record in one statement.
    pub async fn decrement<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        self.adjust(driver, Assignment::Decrement(field.to_string(), step))
            .await
    }

    async fn adjust<D: Driver>(
        &mut self,
        driver: &mut D,
        assignment: Assignment,
    ) -> Result<&mut Self> {
        let id = self
            .key()
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| DbError::MissingKey {
                table: self.meta.name.clone(),
            })?;
        let mut state = QueryState::new(self.meta.name.clone());
        state.where_eq(self.meta.primary_key.clone(), id);
        let prepared = state.update_sql(driver.dialect(), &[assignment])?;
        driver.execute(Some(&prepared.sql), &prepared.binds).await?;
        Ok(self)
    }

    /// The record's fields and values.
    #[must_use]
    pub fn to_row(&self) -> Row {
        self.values.clone()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.values.to_json()
    }

    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] when the fields do not fit `T`.
    pub fn to_object<T: DeserializeOwned>(&self) -> Result<T> {
        self.values.to_object()
    }
}
