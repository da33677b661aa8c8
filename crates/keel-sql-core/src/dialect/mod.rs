//! SQL Dialect support.
//!
//! Backends differ in identifier quoting and in a handful of statement forms.
//! Everything else the builder emits is shared.

mod generic;
mod mysql;
mod sqlite;

pub use generic::GenericDialect;
pub use mysql::MySqlDialect;
pub use sqlite::SqliteDialect;

/// Trait for SQL dialect-specific behavior.
pub trait Dialect: Send + Sync {
    /// Returns the name of the dialect.
    fn name(&self) -> &'static str;

    /// Returns the identifier quote character (e.g., `"` for standard SQL, `` ` `` for MySQL).
    fn identifier_quote(&self) -> char {
        '"'
    }

    /// Returns the parameter placeholder style.
    fn parameter_placeholder(&self) -> &'static str {
        "?"
    }

    /// Quotes an identifier.
    ///
    /// Dotted names are quoted per segment. `*`, already-quoted names and
    /// expressions (anything containing a parenthesis or whitespace) pass
    /// through untouched.
    fn quote_identifier(&self, name: &str) -> String {
        let quote = self.identifier_quote();
        if name == "*"
            || name.starts_with(quote)
            || name.contains(['(', ')', ' ', '\t', '\n'])
        {
            return name.to_string();
        }
        name.split('.')
            .map(|part| {
                if part == "*" {
                    part.to_string()
                } else {
                    let escaped = part.replace(quote, &format!("{quote}{quote}"));
                    format!("{quote}{escaped}{quote}")
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Renders the LIMIT/OFFSET tail, without a leading space.
    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => Some(format!("LIMIT {limit}")),
            (None, Some(offset)) => Some(format!("OFFSET {offset}")),
            (None, None) => None,
        }
    }

    /// Renders a statement emptying `table` (already quoted).
    fn truncate_sql(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {table}")
    }
}
