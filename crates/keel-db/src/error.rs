//! Error types for the data-access layer.

use keel_sql_core::ConditionError;
use thiserror::Error;

/// Data-access errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed WHERE tree.
    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),

    /// Prepare or execute failure.
    #[error("statement failed: {message} [{sql}]")]
    Statement { sql: String, message: String },

    /// Driver misuse: no prepared statement, no live connection, unbalanced
    /// transaction calls.
    #[error("invalid driver state: {0}")]
    State(String),

    /// Delete without an identifying key.
    #[error("no primary key value to delete from `{table}`")]
    MissingKey { table: String },

    /// Update without an identifying condition.
    #[error("update of `{table}` requires a non-null `{primary_key}`")]
    MissingCondition { table: String, primary_key: String },

    /// A single-row lookup matched nothing.
    #[error("no row in `{table}` matches {lookup}")]
    NotFound { table: String, lookup: String },

    /// The statement deadline passed.
    #[error("statement timed out [{sql}]")]
    Timeout { sql: String },

    #[error("cannot connect to `{database}`: {message}")]
    Connection { database: String, message: String },

    #[error("unknown database `{0}`")]
    UnknownDatabase(String),

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("unknown field `{field}` on `{table}`")]
    UnknownField { table: String, field: String },

    /// A result set lacks a column the caller asked for.
    #[error("result has no column `{0}`")]
    MissingColumn(String),

    #[error("driver `{0}` is not supported")]
    UnsupportedDriver(String),

    /// Operation outside a cache proxy allow-list.
    #[error("`{operation}` is not an allowed operation on {target}")]
    UnsupportedOperation { target: String, operation: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Wraps a driver failure together with the statement that caused it.
    pub fn statement(sql: &str, err: impl std::fmt::Display) -> Self {
        Self::Statement {
            sql: sql.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for data-access operations.
pub type Result<T> = std::result::Result<T, DbError>;
