//! SQLite driver over a single `sqlx` connection.

use std::future::Future;
use std::str::FromStr;

use futures::StreamExt;
use keel_sql_core::dialect::SqliteDialect;
use keel_sql_core::{Dialect, SqlValue};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow, SqliteStatement,
};
use sqlx::{Column, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Driver, RowStream, TransactionDepth};
use crate::config::{DbConfig, DriverKind};
use crate::error::{DbError, Result};
use crate::row::Row;
use crate::schema::FieldMeta;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite driver.
///
/// `:memory:` databases live as long as the connection, so closing the
/// driver discards them.
pub struct SqliteDriver {
    name: String,
    config: DbConfig,
    dialect: SqliteDialect,
    connection: Option<SqliteConnection>,
    statement: Option<SqliteStatement<'static>>,
    rows_affected: u64,
    last_insert_id: Option<i64>,
    transactions: TransactionDepth,
    deadline: Option<Instant>,
}

impl SqliteDriver {
    /// Creates a driver for the logical database `name`. Nothing connects
    /// until the first statement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnsupportedDriver`] for non-SQLite configs.
    pub fn new(name: impl Into<String>, config: DbConfig) -> Result<Self> {
        if config.driver != DriverKind::Sqlite {
            return Err(DbError::UnsupportedDriver(format!("{:?}", config.driver)));
        }
        Ok(Self {
            name: name.into(),
            config,
            dialect: SqliteDialect::new(),
            connection: None,
            statement: None,
            rows_affected: 0,
            last_insert_id: None,
            transactions: TransactionDepth::default(),
            deadline: None,
        })
    }

    /// A private in-memory database.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            name: String::from("memory"),
            config: DbConfig::sqlite(":memory:"),
            dialect: SqliteDialect::new(),
            connection: None,
            statement: None,
            rows_affected: 0,
            last_insert_id: None,
            transactions: TransactionDepth::default(),
            deadline: None,
        }
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let name = self.config.name.trim_start_matches("sqlite://");
        let name = name.trim_start_matches("sqlite:");
        if name == ":memory:" || name.is_empty() {
            return SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                DbError::Connection {
                    database: self.name.clone(),
                    message: e.to_string(),
                }
            });
        }
        Ok(SqliteConnectOptions::new()
            .filename(name)
            .create_if_missing(true))
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// One-shot deadline if set, else the configured per-call timeout.
    fn next_deadline(&mut self) -> Option<Instant> {
        self.deadline
            .take()
            .or_else(|| self.config.timeout().map(|t| Instant::now() + t))
    }

    fn connection(&mut self) -> Result<&mut SqliteConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::State(String::from("no live connection")))
    }

    async fn run_raw(&mut self, sql: &str) -> Result<()> {
        self.ensure_connected().await?;
        let conn = self.connection()?;
        sqlx::raw_sql(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::statement(sql, e))?;
        Ok(())
    }

    async fn prepare_with(&mut self, sql: &str, deadline: Option<Instant>) -> Result<()> {
        self.free();
        self.ensure_connected().await?;
        let conn = self.connection()?;
        let prepared = bounded(deadline, sql, sqlx::Executor::prepare(&mut *conn, sql)).await?;
        self.statement = Some(sqlx::Statement::to_owned(&prepared));
        Ok(())
    }

    /// Runs the current statement (or `sql` directly when none is prepared
    /// and no binds are given) and returns its raw rows.
    async fn run_fetch(
        &mut self,
        sql: Option<&str>,
        binds: &[SqlValue],
    ) -> Result<Vec<SqliteRow>> {
        let deadline = self.next_deadline();
        if let Some(sql) = sql {
            debug!(db = %self.name, sql, binds = binds.len(), "Fetching");
            if binds.is_empty() {
                self.free();
                self.ensure_connected().await?;
                let conn = self.connection()?;
                let outcome =
                    bounded(deadline, sql, sqlx::raw_sql(sql).fetch_all(&mut *conn)).await;
                return self.settle(outcome);
            }
            self.prepare_with(sql, deadline).await?;
        }

        let Some(statement) = self.statement.as_ref() else {
            return Err(DbError::State(String::from("no prepared statement")));
        };
        let Some(conn) = self.connection.as_mut() else {
            return Err(DbError::State(String::from("no live connection")));
        };
        let text = sqlx::Statement::sql(statement).to_string();
        let query = bind_all(sqlx::Statement::query(statement), binds);
        let outcome = bounded(deadline, &text, query.fetch_all(&mut *conn)).await;
        self.settle(outcome)
    }

    async fn run_execute(&mut self, sql: Option<&str>, binds: &[SqlValue]) -> Result<u64> {
        let deadline = self.next_deadline();
        if let Some(sql) = sql {
            debug!(db = %self.name, sql, binds = binds.len(), "Executing");
            if binds.is_empty() {
                self.free();
                self.ensure_connected().await?;
                let conn = self.connection()?;
                let outcome = bounded(deadline, sql, sqlx::raw_sql(sql).execute(&mut *conn)).await;
                let result = self.settle(outcome)?;
                return Ok(self.record_write(result.rows_affected(), result.last_insert_rowid()));
            }
            self.prepare_with(sql, deadline).await?;
        }

        let Some(statement) = self.statement.as_ref() else {
            return Err(DbError::State(String::from("no prepared statement")));
        };
        let Some(conn) = self.connection.as_mut() else {
            return Err(DbError::State(String::from("no live connection")));
        };
        let text = sqlx::Statement::sql(statement).to_string();
        let query = bind_all(sqlx::Statement::query(statement), binds);
        let outcome = bounded(deadline, &text, query.execute(&mut *conn)).await;
        let result = self.settle(outcome)?;
        Ok(self.record_write(result.rows_affected(), result.last_insert_rowid()))
    }

    /// Frees the statement after a timeout so the handle is never reused.
    fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if matches!(outcome, Err(DbError::Timeout { .. })) {
            self.free();
        }
        outcome
    }

    fn record_write(&mut self, rows_affected: u64, rowid: i64) -> u64 {
        self.rows_affected = rows_affected;
        if rowid != 0 {
            self.last_insert_id = Some(rowid);
        }
        rows_affected
    }
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("connected", &self.connection.is_some())
            .field("prepared", &self.statement.is_some())
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let options = self.connect_options()?;
        let connection = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| DbError::Connection {
                database: self.name.clone(),
                message: e.to_string(),
            })?;
        info!(db = %self.name, file = %self.config.name, "Opened connection");
        self.connection = Some(connection);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.free();
        self.transactions.reset();
        if let Some(connection) = self.connection.take() {
            connection.close().await?;
            info!(db = %self.name, "Closed connection");
        }
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> Result<()> {
        let deadline = self.next_deadline();
        self.prepare_with(sql, deadline).await
    }

    async fn execute(&mut self, sql: Option<&str>, binds: &[SqlValue]) -> Result<u64> {
        self.run_execute(sql, binds).await
    }

    async fn fetch(&mut self, sql: Option<&str>, binds: &[SqlValue]) -> Result<Vec<Row>> {
        let raw = self.run_fetch(sql, binds).await?;
        self.rows_affected = raw.len() as u64;
        raw.iter().map(decode_row).collect()
    }

    async fn fetch_stream<'a>(
        &'a mut self,
        sql: &'a str,
        binds: &'a [SqlValue],
    ) -> Result<RowStream<'a>> {
        self.free();
        self.ensure_connected().await?;
        let deadline = self.next_deadline();
        debug!(db = %self.name, sql, binds = binds.len(), "Streaming");
        let conn = self.connection()?;
        let rows = bind_all(sqlx::query(sql), binds).fetch(&mut *conn);

        let stream = futures::stream::unfold(
            (Some(rows), deadline, sql),
            |(rows, deadline, sql)| async move {
                let mut rows = rows?;
                let next = match deadline {
                    Some(deadline) => {
                        if let Ok(next) = tokio::time::timeout_at(deadline, rows.next()).await {
                            next
                        } else {
                            warn!(sql, "Stream deadline exceeded");
                            let err = DbError::Timeout {
                                sql: sql.to_string(),
                            };
                            return Some((Err(err), (None, Some(deadline), sql)));
                        }
                    }
                    None => rows.next().await,
                };
                match next? {
                    Ok(row) => Some((decode_row(&row), (Some(rows), deadline, sql))),
                    Err(e) => Some((Err(DbError::statement(sql, e)), (None, deadline, sql))),
                }
            },
        );
        Ok(stream.boxed())
    }

    fn free(&mut self) {
        self.statement = None;
    }

    fn row_count(&self) -> u64 {
        self.rows_affected
    }

    fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }

    fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn transactions(&self) -> &TransactionDepth {
        &self.transactions
    }

    fn transactions_mut(&mut self) -> &mut TransactionDepth {
        &mut self.transactions
    }

    async fn begin_physical(&mut self) -> Result<()> {
        self.run_raw("BEGIN").await?;
        info!(db = %self.name, "Transaction started");
        Ok(())
    }

    async fn commit_physical(&mut self) -> Result<()> {
        self.run_raw("COMMIT").await?;
        info!(db = %self.name, "Transaction committed");
        Ok(())
    }

    async fn rollback_physical(&mut self) -> Result<()> {
        self.run_raw("ROLLBACK").await?;
        info!(db = %self.name, "Transaction rolled back");
        Ok(())
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        let names = self
            .values(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;
        Ok(names.iter().map(SqlValue::key_string).collect())
    }

    async fn table_fields(&mut self, table: &str) -> Result<Vec<FieldMeta>> {
        let sql = format!("PRAGMA table_info({})", self.dialect.quote_identifier(table));
        let rows = self.fetch(Some(&sql), &[]).await?;
        if rows.is_empty() {
            return Err(DbError::UnknownTable(table.to_string()));
        }
        Ok(rows
            .iter()
            .map(|row| FieldMeta {
                name: row.get("name").map(SqlValue::key_string).unwrap_or_default(),
                sql_type: row.get("type").map(SqlValue::key_string).unwrap_or_default(),
                nullable: row.get("notnull").and_then(SqlValue::as_i64) == Some(0),
                default: row
                    .get("dflt_value")
                    .filter(|v| !v.is_null())
                    .map(SqlValue::key_string),
                primary_key: row.get("pk").and_then(SqlValue::as_i64).unwrap_or(0) > 0,
            })
            .collect())
    }

    async fn version(&mut self) -> Result<String> {
        let version = self.value("SELECT sqlite_version()", &[]).await?;
        Ok(version.map(|v| v.key_string()).unwrap_or_default())
    }
}

/// Awaits `fut`, failing with [`DbError::Timeout`] once `deadline` passes.
async fn bounded<T, F>(deadline: Option<Instant>, sql: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let outcome = match deadline {
        Some(deadline) => {
            if let Ok(outcome) = tokio::time::timeout_at(deadline, fut).await {
                outcome
            } else {
                warn!(sql, "Statement deadline exceeded");
                return Err(DbError::Timeout {
                    sql: sql.to_string(),
                });
            }
        }
        None => fut.await,
    };
    outcome.map_err(|e| DbError::statement(sql, e))
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, binds: &[SqlValue]) -> SqliteQuery<'q> {
    for value in binds {
        query = bind_value(query, value.clone());
    }
    query
}

fn bind_value(query: SqliteQuery<'_>, value: SqlValue) -> SqliteQuery<'_> {
    match value {
        SqlValue::Null => query.bind(Option::<i64>::None),
        SqlValue::Bool(b) => query.bind(b),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Float(f) => query.bind(f),
        SqlValue::Text(s) => query.bind(s),
        SqlValue::Blob(b) => query.bind(b),
    }
}

/// Maps a row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let kind = raw.type_info().name().to_string();
            match kind.as_str() {
                "INTEGER" => SqlValue::Int(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => SqlValue::Float(row.try_get_unchecked::<f64, _>(i)?),
                "BLOB" => SqlValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(i)?),
                _ => SqlValue::Text(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        out.set(column.name(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use futures::TryStreamExt;
    use serde::Deserialize;

    use super::*;

    async fn setup() -> SqliteDriver {
        let mut driver = SqliteDriver::memory();
        driver
            .execute(
                Some(
                    "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                     name TEXT, age INTEGER, score REAL, avatar BLOB)",
                ),
                &[],
            )
            .await
            .unwrap();
        driver
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    fn user(name: &str, age: i64) -> Row {
        Row::new().with("name", name).with("age", age)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: i64,
        name: String,
        age: i64,
    }

    #[tokio::test]
    async fn test_lazy_connect() {
        let mut driver = SqliteDriver::memory();
        assert!(!driver.is_connected());
        assert!(driver.version().await.unwrap().starts_with('3'));
        assert!(driver.is_connected());
        driver.close().await.unwrap();
        assert!(!driver.is_connected());
    }

    #[test]
    fn test_rejects_other_backends() {
        let mut config = DbConfig::sqlite("shop");
        config.driver = DriverKind::Mysql;
        assert!(matches!(
            SqliteDriver::new("legacy", config),
            Err(DbError::UnsupportedDriver(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_without_statement_is_state_error() {
        let mut driver = setup().await;
        let err = driver.execute(None, &[SqlValue::Int(1)]).await.unwrap_err();
        assert!(matches!(err, DbError::State(_)));
    }

    #[tokio::test]
    async fn test_prepared_statement_reuse() {
        let mut driver = setup().await;
        driver
            .prepare("INSERT INTO users (name, age) VALUES (?, ?)")
            .await
            .unwrap();
        for (name, age) in [("a", 1), ("b", 2)] {
            let affected = driver
                .execute(None, &[text(name), SqlValue::Int(age)])
                .await
                .unwrap();
            assert_eq!(affected, 1);
        }
        assert_eq!(driver.last_insert_id(), Some(2));
        driver.free();
        assert!(matches!(
            driver.execute(None, &[]).await,
            Err(DbError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_statement_error_carries_sql() {
        let mut driver = setup().await;
        let err = driver
            .execute(Some("INSERT INTO missing VALUES (?)"), &[SqlValue::Int(1)])
            .await
            .unwrap_err();
        match err {
            DbError::Statement { sql, message } => {
                assert_eq!(sql, "INSERT INTO missing VALUES (?)");
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_nested_transactions_commit_at_depth_zero() {
        let mut driver = setup().await;
        driver.begin().await.unwrap();
        assert_eq!(driver.transaction_depth(), 1);
        driver.begin().await.unwrap();
        assert_eq!(driver.transaction_depth(), 2);
        driver.insert("users", &user("Tom", 30)).await.unwrap();

        driver.rollback().await.unwrap();
        assert_eq!(driver.transaction_depth(), 1);
        assert!(driver.in_transaction());

        driver.commit().await.unwrap();
        assert_eq!(driver.transaction_depth(), 0);

        let count = driver
            .value("SELECT COUNT(*) FROM users", &[])
            .await
            .unwrap();
        assert_eq!(count, Some(SqlValue::Int(1)));
    }

    #[tokio::test]
    async fn test_outer_rollback_discards_inner_work() {
        let mut driver = setup().await;
        driver.begin().await.unwrap();
        driver.begin().await.unwrap();
        driver.insert("users", &user("Tom", 30)).await.unwrap();
        driver.commit().await.unwrap();
        driver.rollback().await.unwrap();

        let count = driver
            .value("SELECT COUNT(*) FROM users", &[])
            .await
            .unwrap();
        assert_eq!(count, Some(SqlValue::Int(0)));
    }

    #[tokio::test]
    async fn test_unbalanced_transaction_calls() {
        let mut driver = setup().await;
        assert!(matches!(driver.rollback().await, Err(DbError::State(_))));
        assert!(matches!(driver.commit().await, Err(DbError::State(_))));
        assert_eq!(driver.transaction_depth(), 0);
    }

    #[tokio::test]
    async fn test_update_skips_nulls() {
        let mut driver = setup().await;
        driver.insert("users", &user("Tom", 20)).await.unwrap();
        let id = driver.last_insert_id().unwrap();

        let change = Row::new()
            .with("id", id)
            .with("name", SqlValue::Null)
            .with("age", 30);
        assert_eq!(driver.update("users", &change, "id", &[]).await.unwrap(), 1);
        let first: Option<User> = driver
            .object("SELECT id, name, age FROM users WHERE id = ?", &[SqlValue::Int(id)])
            .await
            .unwrap();

        driver.update("users", &change, "id", &[]).await.unwrap();
        let second: Option<User> = driver
            .object("SELECT id, name, age FROM users WHERE id = ?", &[SqlValue::Int(id)])
            .await
            .unwrap();

        let expected = User {
            id,
            name: String::from("Tom"),
            age: 30,
        };
        assert_eq!(first.as_ref(), Some(&expected));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_update_set_null_marker() {
        let mut driver = setup().await;
        driver.insert("users", &user("Tom", 20)).await.unwrap();
        let change = Row::new().with("id", 1);
        driver
            .update("users", &change, "id", &[String::from("name")])
            .await
            .unwrap();
        let name = driver
            .value("SELECT name FROM users WHERE id = 1", &[])
            .await
            .unwrap();
        assert_eq!(name, Some(SqlValue::Null));
    }

    #[tokio::test]
    async fn test_update_requires_primary_key() {
        let mut driver = setup().await;
        let err = driver
            .update("users", &user("Tom", 1), "id", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MissingCondition { .. }));

        let null_key = user("Tom", 1).with("id", SqlValue::Null);
        let err = driver.update("users", &null_key, "id", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::MissingCondition { .. }));
    }

    #[tokio::test]
    async fn test_update_with_nothing_to_write() {
        let mut driver = setup().await;
        let change = Row::new().with("id", 1).with("name", SqlValue::Null);
        assert_eq!(driver.update("users", &change, "id", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_batch_and_materializers() {
        let mut driver = setup().await;
        let inserted = driver
            .insert_batch("users", &[user("a", 10), user("b", 20), user("c", 30)])
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let names = driver
            .values("SELECT name FROM users ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(
            names,
            vec![
                text("a"),
                text("b"),
                text("c")
            ]
        );

        let ages = driver
            .key_values("SELECT name, age FROM users", &[])
            .await
            .unwrap();
        assert_eq!(ages.get("b"), Some(&SqlValue::Int(20)));

        let rows = driver
            .key_rows("SELECT * FROM users WHERE age > ?", &[SqlValue::Int(15)], "name")
            .await
            .unwrap();
        assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(driver.row_count(), 2);

        let users: BTreeMap<String, User> = driver
            .key_objects("SELECT id, name, age FROM users", &[], "id")
            .await
            .unwrap();
        assert_eq!(users["3"].name, "c");

        let all: Vec<User> = driver
            .objects("SELECT id, name, age FROM users ORDER BY age DESC", &[])
            .await
            .unwrap();
        assert_eq!(all[0].age, 30);

        let missing = driver
            .row("SELECT * FROM users WHERE id = ?", &[SqlValue::Int(99)])
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_insert_batch_requires_same_shape() {
        let mut driver = setup().await;
        let err = driver
            .insert_batch("users", &[user("a", 1), Row::new().with("name", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MissingColumn(column) if column == "age"));

        // The half-run batch statement is gone.
        let err = driver
            .execute(None, &[SqlValue::Text(String::from("c")), SqlValue::Int(3)])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::State(_)));
        let count = driver.value("SELECT COUNT(*) FROM users", &[]).await.unwrap();
        assert_eq!(count, Some(SqlValue::Int(1)));
    }

    #[tokio::test]
    async fn test_decodes_storage_classes() {
        let mut driver = setup().await;
        let record = Row::new()
            .with("name", "x")
            .with("score", 1.5)
            .with("avatar", vec![0_u8, 1, 2]);
        driver.insert("users", &record).await.unwrap();
        let row = driver
            .row("SELECT * FROM users", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("id"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get("age"), Some(&SqlValue::Null));
        assert_eq!(row.get("score"), Some(&SqlValue::Float(1.5)));
        assert_eq!(row.get("avatar"), Some(&SqlValue::Blob(vec![0, 1, 2])));
    }

    #[tokio::test]
    async fn test_streams() {
        let mut driver = setup().await;
        driver
            .insert_batch("users", &[user("a", 1), user("b", 2)])
            .await
            .unwrap();

        let rows: Vec<Row> = driver
            .fetch_stream("SELECT * FROM users ORDER BY id", &[])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let binds = [SqlValue::Int(1)];
        let names: Vec<SqlValue> = driver
            .stream_values("SELECT name FROM users WHERE age > ?", &binds)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec![text("b")]);

        let users: Vec<User> = driver
            .stream_objects("SELECT id, name, age FROM users", &[])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_frees_statement() {
        let mut driver = setup().await;
        let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < ?) \
                    SELECT COUNT(*) FROM c";
        driver.set_deadline(Instant::now() + Duration::from_millis(10));
        let err = driver
            .value(slow, &[SqlValue::Int(20_000_000)])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(matches!(
            driver.execute(None, &[SqlValue::Int(1)]).await,
            Err(DbError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_describe_and_drop() {
        let mut driver = setup().await;
        assert_eq!(driver.tables().await.unwrap(), vec![String::from("users")]);
        let fields = driver.table_fields("users").await.unwrap();
        assert!(fields[0].primary_key);
        assert!(matches!(
            driver.table_fields("nope").await,
            Err(DbError::UnknownTable(_))
        ));
        driver.drop_table("users").await.unwrap();
        driver.drop_table("users").await.unwrap();
        assert!(driver.tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.sqlite3");
        let config = DbConfig::sqlite(path.to_string_lossy().into_owned());

        let mut driver = SqliteDriver::new("master", config.clone()).unwrap();
        driver
            .execute(Some("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)"), &[])
            .await
            .unwrap();
        driver
            .insert("kv", &Row::new().with("k", "a").with("v", "1"))
            .await
            .unwrap();
        driver.close().await.unwrap();

        let mut reopened = SqliteDriver::new("master", config).unwrap();
        let v = reopened
            .value("SELECT v FROM kv WHERE k = ?", &[text("a")])
            .await
            .unwrap();
        assert_eq!(v, Some(text("1")));
        assert_eq!(reopened.quote(&text("it's")), "'it''s'");
    }
}
