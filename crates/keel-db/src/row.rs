//! Column-ordered rows.

use std::fmt;

use keel_sql_core::{SqlValue, ToSqlValue};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{DbError, Result};

/// One result row, or one record to write, with columns in statement order.
///
/// Serializes as a plain map (`{"id": 1, "name": "Tom"}`), keeping column
/// order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Sets a column, replacing an existing value in place.
    pub fn set(&mut self, column: impl Into<String>, value: impl ToSqlValue) -> &mut Self {
        let column = column.into();
        let value = value.to_sql_value();
        match self.position(&column) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
        self
    }

    /// Builder form of [`Row::set`].
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl ToSqlValue) -> Self {
        self.set(column, value);
        self
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.position(column).map(|i| &self.values[i])
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.position(column).is_some()
    }

    pub fn remove(&mut self, column: &str) -> Option<SqlValue> {
        let i = self.position(column)?;
        self.columns.remove(i);
        Some(self.values.remove(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// First column's value.
    #[must_use]
    pub fn first(&self) -> Option<&SqlValue> {
        self.values.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.iter()
                .map(|(column, value)| (column.to_string(), value_to_json(value)))
                .collect(),
        )
    }

    /// Builds a row from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] when `value` is not an object.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Builds a row from anything serializing to a map, such as a struct.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] when `source` is not map-shaped.
    pub fn from_serialize<T: Serialize>(source: &T) -> Result<Self> {
        Self::from_json(serde_json::to_value(source)?)
    }

    /// Deserializes the row into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] when the columns do not fit `T`.
    pub fn to_object<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json()).map_err(DbError::from)
    }
}

impl<C: Into<String>> FromIterator<(C, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (C, SqlValue)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (column, value) in iter {
            row.set(column, value);
        }
        row
    }
}

/// Maps a bind value onto its natural JSON form. Blobs become byte arrays.
#[must_use]
pub fn value_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Bool(*b),
        SqlValue::Int(n) => Value::from(*n),
        SqlValue::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s.clone()),
        SqlValue::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

/// Inverse of [`value_to_json`]. Arrays of bytes become blobs; other nested
/// JSON is stored as its text.
#[must_use]
pub fn json_to_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Bool(b),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Int)
            .or_else(|| n.as_f64().map(SqlValue::Float))
            .unwrap_or_else(|| SqlValue::Text(n.to_string())),
        Value::String(s) => SqlValue::Text(s),
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect();
            match bytes {
                Some(bytes) if !items.is_empty() => SqlValue::Blob(bytes),
                _ => SqlValue::Text(Value::Array(items).to_string()),
            }
        }
        Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

struct Plain<'a>(&'a SqlValue);

impl Serialize for Plain<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Bool(b) => serializer.serialize_bool(*b),
            SqlValue::Int(n) => serializer.serialize_i64(*n),
            SqlValue::Float(f) => serializer.serialize_f64(*f),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Blob(b) => serializer.serialize_bytes(b),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, &Plain(value))?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of column names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Row, A::Error> {
        let mut row = Row::new();
        while let Some((column, value)) = access.next_entry::<String, Value>()? {
            row.set(column, json_to_value(value));
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}
