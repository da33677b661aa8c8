//! Database drivers.
//!
//! A [`Driver`] owns one physical connection and at most one prepared
//! statement. It is not shared: each unit of work holds one driver
//! exclusively, and statement lifecycle on it is never interleaved.
//!
//! Transactions nest through a depth counter. Only the outermost `begin`
//! issues `BEGIN`, and only the call that brings the depth back to zero
//! issues `COMMIT` or `ROLLBACK`. Inner calls just balance the counter.

mod sqlite;

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use keel_sql_core::{Assignment, Dialect, QueryState, SqlValue};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::error::{DbError, Result};
use crate::row::Row;
use crate::schema::FieldMeta;

pub use sqlite::SqliteDriver;

/// A single-pass, non-restartable sequence of rows.
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// Nested transaction depth of one driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDepth {
    depth: u32,
}

impl TransactionDepth {
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    pub fn enter(&mut self) {
        self.depth += 1;
    }

    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        self.depth = 0;
    }
}

/// Connection, statement and transaction management for one backend.
#[allow(async_fn_in_trait)]
pub trait Driver: Send {
    /// Logical database name.
    fn name(&self) -> &str;

    fn dialect(&self) -> &dyn Dialect;

    fn is_connected(&self) -> bool;

    /// Opens the physical connection. Called lazily by statement methods.
    async fn connect(&mut self) -> Result<()>;

    /// Frees the statement and closes the connection.
    async fn close(&mut self) -> Result<()>;

    /// Prepares `sql` as the current statement, replacing any previous one.
    async fn prepare(&mut self, sql: &str) -> Result<()>;

    /// Executes a write and returns the number of rows affected.
    ///
    /// With `sql`, a fresh statement runs: directly when `binds` is empty,
    /// otherwise prepared and bound. Without `sql`, the current prepared
    /// statement is bound and executed; a missing one is a
    /// [`DbError::State`].
    async fn execute(&mut self, sql: Option<&str>, binds: &[SqlValue]) -> Result<u64>;

    /// Like [`Driver::execute`] but returns all result rows.
    async fn fetch(&mut self, sql: Option<&str>, binds: &[SqlValue]) -> Result<Vec<Row>>;

    /// Lazily produced rows of a fresh statement.
    async fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        binds: &'a [SqlValue],
    ) -> Result<RowStream<'a>>;

    /// Releases the prepared statement, if any.
    fn free(&mut self);

    /// Rows affected (or fetched) by the last statement.
    fn row_count(&self) -> u64;

    /// Key generated by the most recent insert on this connection.
    fn last_insert_id(&self) -> Option<i64>;

    /// Deadline for the next statement call only.
    fn set_deadline(&mut self, deadline: Instant);

    fn transactions(&self) -> &TransactionDepth;

    fn transactions_mut(&mut self) -> &mut TransactionDepth;

    async fn begin_physical(&mut self) -> Result<()>;

    async fn commit_physical(&mut self) -> Result<()>;

    async fn rollback_physical(&mut self) -> Result<()>;

    /// Names of the user tables.
    async fn tables(&mut self) -> Result<Vec<String>>;

    /// Describes the columns of `table`.
    async fn table_fields(&mut self, table: &str) -> Result<Vec<FieldMeta>>;

    /// Backend server version.
    async fn version(&mut self) -> Result<String>;

    /// Opens a (possibly nested) transaction.
    async fn begin(&mut self) -> Result<()> {
        if self.transactions().depth() == 0 {
            self.begin_physical().await?;
        }
        self.transactions_mut().enter();
        Ok(())
    }

    /// Closes one nesting level; commits when it was the outermost.
    ///
    /// A failed physical commit keeps the depth at one so the caller can
    /// still roll back.
    async fn commit(&mut self) -> Result<()> {
        match self.transactions().depth() {
            0 => Err(DbError::State(String::from(
                "commit without an open transaction",
            ))),
            1 => {
                self.commit_physical().await?;
                self.transactions_mut().leave();
                Ok(())
            }
            _ => {
                self.transactions_mut().leave();
                Ok(())
            }
        }
    }

    /// Closes one nesting level; rolls back when it was the outermost.
    async fn rollback(&mut self) -> Result<()> {
        match self.transactions().depth() {
            0 => Err(DbError::State(String::from(
                "rollback without an open transaction",
            ))),
            1 => {
                self.transactions_mut().leave();
                self.rollback_physical().await
            }
            _ => {
                self.transactions_mut().leave();
                Ok(())
            }
        }
    }

    fn in_transaction(&self) -> bool {
        self.transactions().depth() > 0
    }

    fn transaction_depth(&self) -> u32 {
        self.transactions().depth()
    }

    /// First column of the first row.
    async fn value(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Option<SqlValue>> {
        let rows = self.fetch(Some(sql), binds).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next()))
    }

    /// First column of every row.
    async fn values(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Vec<SqlValue>> {
        let rows = self.fetch(Some(sql), binds).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_values().into_iter().next())
            .collect())
    }

    /// First column mapped to second column.
    async fn key_values(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<BTreeMap<String, SqlValue>> {
        let rows = self.fetch(Some(sql), binds).await?;
        rows.into_iter()
            .map(|row| {
                let mut values = row.into_values().into_iter();
                let key = values.next().unwrap_or(SqlValue::Null).key_string();
                let value = values
                    .next()
                    .ok_or_else(|| DbError::MissingColumn(String::from("#2")))?;
                Ok((key, value))
            })
            .collect()
    }

    async fn row(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.fetch(Some(sql), binds).await?.into_iter().next())
    }

    async fn rows(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Vec<Row>> {
        self.fetch(Some(sql), binds).await
    }

    /// Rows keyed by the value of column `key`.
    async fn key_rows(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
        key: &str,
    ) -> Result<BTreeMap<String, Row>> {
        let rows = self.fetch(Some(sql), binds).await?;
        key_rows(rows, key)
    }

    async fn object<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Option<T>> {
        self.row(sql, binds)
            .await?
            .map(|row| row.to_object())
            .transpose()
    }

    async fn objects<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Vec<T>> {
        self.rows(sql, binds)
            .await?
            .iter()
            .map(Row::to_object)
            .collect()
    }

    async fn key_objects<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
        key: &str,
    ) -> Result<BTreeMap<String, T>> {
        self.key_rows(sql, binds, key)
            .await?
            .into_iter()
            .map(|(k, row)| Ok((k, row.to_object()?)))
            .collect()
    }

    /// First column of each row, lazily.
    async fn stream_values<'a>(
        &'a mut self,
        sql: &'a str,
        binds: &'a [SqlValue],
    ) -> Result<BoxStream<'a, Result<SqlValue>>> {
        let rows = self.fetch_stream(sql, binds).await?;
        Ok(rows
            .map(|row| {
                row.and_then(|row| {
                    row.into_values()
                        .into_iter()
                        .next()
                        .ok_or_else(|| DbError::MissingColumn(String::from("#1")))
                })
            })
            .boxed())
    }

    /// Rows deserialized into `T`, lazily.
    async fn stream_objects<'a, T: DeserializeOwned + Send + 'a>(
        &'a mut self,
        sql: &'a str,
        binds: &'a [SqlValue],
    ) -> Result<BoxStream<'a, Result<T>>> {
        let rows = self.fetch_stream(sql, binds).await?;
        Ok(rows.map(|row| row.and_then(|row| row.to_object())).boxed())
    }

    /// Inserts one record. An empty record inserts a row of defaults.
    async fn insert(&mut self, table: &str, record: &Row) -> Result<u64> {
        let sql = insert_sql(self.dialect(), table, record.columns());
        self.execute(Some(&sql), record.values()).await
    }

    /// Inserts same-shaped records through one prepared statement.
    ///
    /// The column set of the first record decides the statement; every other
    /// record must carry those columns.
    async fn insert_batch(&mut self, table: &str, records: &[Row]) -> Result<u64> {
        let Some(first) = records.first() else {
            return Ok(0);
        };
        let columns = first.columns().to_vec();
        let sql = insert_sql(self.dialect(), table, &columns);
        self.prepare(&sql).await?;

        // Freed on every exit, failures included.
        let mut total = 0;
        for record in records {
            let step = match batch_binds(&columns, record) {
                Ok(binds) => self.execute(None, &binds).await,
                Err(err) => Err(err),
            };
            match step {
                Ok(affected) => total += affected,
                Err(err) => {
                    self.free();
                    return Err(err);
                }
            }
        }
        self.free();
        Ok(total)
    }

    /// Updates the row identified by `primary_key`.
    ///
    /// Null values in `record` leave their columns unchanged. Columns listed
    /// in `set_null` and not otherwise assigned are written as SQL NULL.
    /// Nothing is executed when there is nothing to write.
    async fn update(
        &mut self,
        table: &str,
        record: &Row,
        primary_key: &str,
        set_null: &[String],
    ) -> Result<u64> {
        let key = record
            .get(primary_key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| DbError::MissingCondition {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
            })?;

        let mut assignments: Vec<Assignment> = record
            .iter()
            .filter(|(column, value)| *column != primary_key && !value.is_null())
            .map(|(column, value)| Assignment::Value(column.to_string(), value.clone()))
            .collect();
        for column in set_null {
            let assigned = record.get(column).is_some_and(|v| !v.is_null());
            if column != primary_key && !assigned {
                assignments.push(Assignment::Null(column.clone()));
            }
        }
        if assignments.is_empty() {
            return Ok(0);
        }

        let mut state = QueryState::new(table);
        state.where_eq(primary_key, key);
        let prepared = state.update_sql(self.dialect(), &assignments)?;
        self.execute(Some(&prepared.sql), &prepared.binds).await
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {}",
            self.dialect().quote_identifier(table)
        );
        self.execute(Some(&sql), &[]).await?;
        Ok(())
    }

    /// Escaped literal form of `value`, for display.
    fn quote(&self, value: &SqlValue) -> String {
        value.to_sql_inline()
    }
}

/// The values of `record` in `columns` order.
fn batch_binds(columns: &[String], record: &Row) -> Result<Vec<SqlValue>> {
    columns
        .iter()
        .map(|c| {
            record
                .get(c)
                .cloned()
                .ok_or_else(|| DbError::MissingColumn(c.clone()))
        })
        .collect()
}

fn insert_sql(dialect: &dyn Dialect, table: &str, columns: &[String]) -> String {
    let table = dialect.quote_identifier(table);
    if columns.is_empty() {
        return format!("INSERT INTO {table} DEFAULT VALUES");
    }
    let names: Vec<String> = columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect();
    let marks = vec![dialect.parameter_placeholder(); columns.len()].join(", ");
    format!("INSERT INTO {table} ({}) VALUES ({marks})", names.join(", "))
}

pub(crate) fn key_rows(rows: Vec<Row>, key: &str) -> Result<BTreeMap<String, Row>> {
    rows.into_iter()
        .map(|row| {
            let k = row
                .get(key)
                .ok_or_else(|| DbError::MissingColumn(key.to_string()))?
                .key_string();
            Ok((k, row))
        })
        .collect()
}
