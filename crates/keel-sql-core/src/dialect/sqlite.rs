//! SQLite dialect.

use super::Dialect;

/// SQLite has no TRUNCATE and requires LIMIT before OFFSET.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, Some(offset)) => Some(format!("LIMIT -1 OFFSET {offset}")),
            (Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => Some(format!("LIMIT {limit}")),
            (None, None) => None,
        }
    }

    fn truncate_sql(&self, table: &str) -> String {
        format!("DELETE FROM {table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_dialect() {
        let dialect = SqliteDialect::new();
        assert_eq!(dialect.name(), "sqlite");
        assert_eq!(dialect.truncate_sql("\"t\""), "DELETE FROM \"t\"");
        assert_eq!(
            dialect.limit_clause(None, Some(3)).as_deref(),
            Some("LIMIT -1 OFFSET 3")
        );
    }
}
