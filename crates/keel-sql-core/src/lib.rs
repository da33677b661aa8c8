//! # keel-sql-core
//!
//! Parameterized SQL generation for the keel data-access layer.
//!
//! This crate provides:
//! - [`SqlValue`] bind values with escaped inline rendering for diagnostics
//! - [`WhereClause`] trees of predicates, groups and trusted fragments with
//!   automatic `AND` insertion
//! - [`QueryState`], the accumulated state of a multi-row query, compiled
//!   into [`PreparedSql`] for a given [`Dialect`]
//!
//! No I/O happens here; drivers live in `keel-db`.
//!
//! ```rust
//! use keel_sql_core::{Condition, Operator, QueryState, SqlValue, dialect::GenericDialect};
//!
//! let mut state = QueryState::new("users");
//! state
//!     .where_op("age", Operator::Between, [18, 30])
//!     .where_group(vec![
//!         Condition::eq("role", "admin"),
//!         Condition::Or,
//!         Condition::compare("id", Operator::In, [1, 2]),
//!     ])
//!     .order_by("-age")
//!     .limit(10);
//!
//! let prepared = state.select_sql(&GenericDialect::new(), Some("id")).unwrap();
//! assert_eq!(
//!     prepared.sql,
//!     "SELECT id FROM \"users\" WHERE \"age\" BETWEEN ? AND ? \
//!      AND (\"role\" = ? OR \"id\" IN (?,?)) ORDER BY \"age\" DESC LIMIT 10"
//! );
//! assert_eq!(prepared.binds[0], SqlValue::Int(18));
//! ```

pub mod condition;
pub mod dialect;
pub mod query;
pub mod value;

pub use condition::{Condition, ConditionError, Operand, Operator, WhereClause};
pub use dialect::Dialect;
pub use query::{Assignment, Join, JoinKind, OrderBy, OrderDirection, PreparedSql, QueryState};
pub use value::{SqlValue, ToSqlValue};
