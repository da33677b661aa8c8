//! # keel-db
//!
//! Transaction-aware database access on top of `keel-sql-core`.
//!
//! This crate provides:
//! - [`Driver`], one exclusive connection with a reusable prepared statement,
//!   nested transactions, deadlines and result materializers
//!   ([`SqliteDriver`] over `sqlx`)
//! - [`Table`], a fluent multi-row query builder
//! - [`Tuple`], a single-row active record
//! - [`CacheProxy`], which memoizes reads and invalidates on writes over a
//!   [`CacheBackend`] ([`MemoryCache`], [`FileCache`])
//! - [`Container`], wiring configuration, schema registry and cache
//!
//! ## Quick Start
//!
//! ```ignore
//! use keel_db::{Container, Driver, Operator};
//!
//! async fn example() -> keel_db::Result<()> {
//!     let container = Container::load("keel.json").await?;
//!     let mut db = container.driver("master")?;
//!
//!     db.begin().await?;
//!     let mut tom = container.tuple("master", "users")?;
//!     tom.set("name", "Tom")?.set("age", 31)?;
//!     tom.save(&mut db).await?;
//!     db.commit().await?;
//!
//!     let mut users = container.cached(container.table("master", "users")?);
//!     users.where_op("age", Operator::Gt, 18).order_by("-age");
//!     let adults = users.rows(&mut db).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod driver;
pub mod error;
pub mod row;
pub mod schema;
pub mod table;
pub mod tuple;

pub use cache::{CacheBackend, CacheProxy, CacheStore, Cacheable, FileCache, MemoryCache};
pub use config::{AppConfig, CacheBackendKind, CacheConfig, DbConfig, DriverKind};
pub use container::Container;
pub use driver::{Driver, RowStream, SqliteDriver, TransactionDepth};
pub use error::{DbError, Result};
pub use keel_sql_core::{Condition, Operator, SqlValue, ToSqlValue};
pub use row::Row;
pub use schema::{FieldMeta, SchemaRegistry, TableMeta};
pub use table::Table;
pub use tuple::{Lookup, Tuple};
