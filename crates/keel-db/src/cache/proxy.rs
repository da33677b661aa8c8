//! Memoizing decorator over query builders, records and drivers.
//!
//! Read keys have the shape
//! `keel:{namespace}:{generation}:{operation}:{identity}:{arguments}`.
//! Every write through the proxy bumps `keel:{namespace}:generation`, so all
//! entries cached under the previous generation stop being addressed at
//! once; the proxy then deletes them from the backend.
//!
//! The proxy exposes only the operations it knows how to cache or
//! invalidate. Anything else is reached through [`CacheProxy::target_mut`],
//! outside the cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use keel_sql_core::{Condition, ConditionError, Operand, Operator, SqlValue, ToSqlValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::store::CacheStore;
use crate::driver::{Driver, SqliteDriver};
use crate::error::{DbError, Result};
use crate::row::Row;
use crate::schema::FieldMeta;
use crate::table::Table;
use crate::tuple::{Lookup, Tuple};

/// A target whose operations a [`CacheProxy`] may memoize or invalidate.
pub trait Cacheable {
    /// Operations whose results may be cached.
    const READ_OPERATIONS: &'static [&'static str];
    /// Operations that invalidate the namespace.
    const WRITE_OPERATIONS: &'static [&'static str];

    /// Scope shared by every target whose writes affect the same data.
    fn cache_namespace(&self) -> String;

    /// The target's own state that shapes its results.
    fn cache_identity(&self) -> Result<String>;
}

impl Cacheable for Table {
    const READ_OPERATIONS: &'static [&'static str] = &[
        "value", "values", "key_values", "row", "rows", "key_rows", "object", "objects",
        "key_objects", "count", "sum", "avg", "min", "max",
    ];
    const WRITE_OPERATIONS: &'static [&'static str] = &[
        "update", "set_null", "increment", "decrement", "delete", "truncate", "drop",
    ];

    fn cache_namespace(&self) -> String {
        format!("{}:{}", self.db(), self.name())
    }

    fn cache_identity(&self) -> Result<String> {
        Ok(serde_json::to_string(self.state())?)
    }
}

impl Cacheable for Tuple {
    const READ_OPERATIONS: &'static [&'static str] = &["find", "load"];
    const WRITE_OPERATIONS: &'static [&'static str] = &["save", "delete", "increment", "decrement"];

    fn cache_namespace(&self) -> String {
        format!("{}:{}", self.db(), self.meta().name)
    }

    // Lookups carry everything that selects the row.
    fn cache_identity(&self) -> Result<String> {
        Ok(String::new())
    }
}

impl Cacheable for SqliteDriver {
    const READ_OPERATIONS: &'static [&'static str] = &[
        "value", "values", "key_values", "row", "rows", "key_rows", "object", "objects",
        "key_objects", "tables", "table_fields", "version",
    ];
    const WRITE_OPERATIONS: &'static [&'static str] =
        &["execute", "insert", "insert_batch", "update", "drop_table"];

    fn cache_namespace(&self) -> String {
        self.name().to_string()
    }

    fn cache_identity(&self) -> Result<String> {
        Ok(String::new())
    }
}

macro_rules! memoize {
    ($proxy:ident, $op:literal, $args:expr, $call:expr) => {{
        let key = $proxy.read_key($op, &$args).await?;
        if let Some(hit) = $proxy.lookup(&key).await? {
            return Ok(hit);
        }
        let value = $call.await?;
        $proxy.store(&key, &value).await?;
        Ok(value)
    }};
}

/// Forwards builder-state setters that return `&mut Self`.
macro_rules! forward {
    ($($(#[$attr:meta])* fn $name:ident($($arg:ident: $ty:ty),*);)*) => {
        $(
            $(#[$attr])*
            pub fn $name(&mut self, $($arg: $ty),*) -> &mut Self {
                self.target.$name($($arg),*);
                self
            }
        )*
    };
}

/// Lifetime of entries stored by a proxy built with [`CacheProxy::new`].
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(600);

/// Wraps a [`Cacheable`] target, memoizing its reads and invalidating on its
/// writes.
#[derive(Debug)]
pub struct CacheProxy<T, B = CacheStore> {
    target: T,
    backend: Arc<B>,
    expire: Option<Duration>,
}

impl<T: Cacheable, B: CacheBackend> CacheProxy<T, B> {
    /// Entries expire after [`DEFAULT_EXPIRE`] unless [`Self::with_expire`]
    /// says otherwise.
    pub const fn new(target: T, backend: Arc<B>) -> Self {
        Self {
            target,
            backend,
            expire: Some(DEFAULT_EXPIRE),
        }
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<Duration>) -> Self {
        self.expire = expire;
        self
    }

    pub const fn target(&self) -> &T {
        &self.target
    }

    /// The bare target. Writes made through it bypass invalidation.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn into_inner(self) -> T {
        self.target
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn generation_key(&self) -> String {
        format!("keel:{}:generation", self.target.cache_namespace())
    }

    async fn generation(&self) -> Result<i64> {
        let key = self.generation_key();
        match self.backend.get(&key).await? {
            None => Ok(0),
            Some(text) => Ok(text.trim().parse().unwrap_or_else(|_| {
                warn!(key = %key, "Ignoring corrupt cache generation");
                0
            })),
        }
    }

    async fn read_key<A: Serialize + ?Sized>(&self, op: &str, args: &A) -> Result<String> {
        let generation = self.generation().await?;
        Ok(format!(
            "keel:{}:{generation}:{op}:{}:{}",
            self.target.cache_namespace(),
            self.target.cache_identity()?,
            serde_json::to_string(args)?,
        ))
    }

    async fn lookup<R: DeserializeOwned>(&self, key: &str) -> Result<Option<R>> {
        let Some(text) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&text) {
            Ok(value) => {
                debug!(key, "Cache hit");
                Ok(Some(value))
            }
            Err(err) => {
                warn!(key, error = %err, "Dropping undecodable cache entry");
                self.backend.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn store<R: Serialize + ?Sized>(&self, key: &str, value: &R) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.backend.set(key, &text, self.expire).await
    }

    /// Retires every entry cached for the target's namespace and deletes
    /// those of the generation just left.
    pub async fn invalidate(&self) -> Result<()> {
        let namespace = self.target.cache_namespace();
        let generation = self.backend.increment(&self.generation_key(), 1).await?;
        let retired = format!("keel:{namespace}:{}:", generation - 1);
        let removed = self.backend.delete_prefix(&retired).await?;
        debug!(namespace = %namespace, generation, removed, "Cache invalidated");
        Ok(())
    }

    fn allow(&self, op: &str, allowed: &[&str]) -> Result<()> {
        if allowed.contains(&op) {
            Ok(())
        } else {
            Err(DbError::UnsupportedOperation {
                target: self.target.cache_namespace(),
                operation: op.to_string(),
            })
        }
    }

    /// Memoizes a read named in [`Cacheable::READ_OPERATIONS`].
    ///
    /// `args` is the part of the call's input that shapes its result; `ctx`
    /// is lent to `call` alongside the target (usually a driver).
    pub async fn read<C, A, R, F>(&mut self, ctx: &mut C, op: &str, args: &A, call: F) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: for<'a> FnOnce(&'a mut T, &'a mut C) -> LocalBoxFuture<'a, Result<R>>,
    {
        self.allow(op, T::READ_OPERATIONS)?;
        let key = self.read_key(op, args).await?;
        if let Some(hit) = self.lookup(&key).await? {
            return Ok(hit);
        }
        let value = call(&mut self.target, ctx).await?;
        self.store(&key, &value).await?;
        Ok(value)
    }

    /// Runs a write named in [`Cacheable::WRITE_OPERATIONS`] and invalidates
    /// the namespace, whether or not the write succeeded.
    pub async fn write<C, R, F>(&mut self, ctx: &mut C, op: &str, call: F) -> Result<R>
    where
        F: for<'a> FnOnce(&'a mut T, &'a mut C) -> LocalBoxFuture<'a, Result<R>>,
    {
        self.allow(op, T::WRITE_OPERATIONS)?;
        let outcome = call(&mut self.target, ctx).await;
        self.invalidate().await?;
        outcome
    }
}

impl<B: CacheBackend> CacheProxy<Table, B> {
    forward! {
        fn alias(alias: impl Into<String>);
        fn select(fields: impl Into<String>);
        fn join(table: impl Into<String>, on: impl Into<String>);
        fn left_join(table: impl Into<String>, on: impl Into<String>);
        fn right_join(table: impl Into<String>, on: impl Into<String>);
        fn full_join(table: impl Into<String>, on: impl Into<String>);
        fn cross_join(table: impl Into<String>);
        fn filter(condition: impl Into<Condition>);
        fn where_eq(field: impl Into<String>, value: impl Into<Operand>);
        fn where_op(field: impl Into<String>, op: Operator, operand: impl Into<Operand>);
        fn where_raw(sql: impl Into<String>);
        fn where_bound(sql: impl Into<String>, binds: Vec<SqlValue>);
        fn where_group(items: Vec<Condition>);
        fn and();
        fn or();
        fn group_by(field: impl Into<String>);
        fn having(condition: impl Into<Condition>);
        fn order_by(spec: &str);
        fn limit(limit: u64);
        fn offset(offset: u64);
        /// Clears the query state; cached entries are untouched.
        fn init();
    }

    /// # Errors
    ///
    /// Returns [`ConditionError::UnknownOperator`] for unsupported operators.
    pub fn where_parse(
        &mut self,
        field: impl Into<String>,
        op: &str,
        operand: impl Into<Operand>,
    ) -> std::result::Result<&mut Self, ConditionError> {
        self.target.where_parse(field, op, operand)?;
        Ok(self)
    }

    pub async fn value<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        memoize!(self, "value", field, self.target.value(driver, field))
    }

    pub async fn values<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Vec<SqlValue>> {
        memoize!(self, "values", field, self.target.values(driver, field))
    }

    pub async fn key_values<D: Driver>(
        &mut self,
        driver: &mut D,
        key_field: &str,
        value_field: &str,
    ) -> Result<BTreeMap<String, SqlValue>> {
        memoize!(
            self,
            "key_values",
            (key_field, value_field),
            self.target.key_values(driver, key_field, value_field)
        )
    }

    pub async fn row<D: Driver>(&mut self, driver: &mut D) -> Result<Option<Row>> {
        memoize!(self, "row", (), self.target.row(driver))
    }

    pub async fn rows<D: Driver>(&mut self, driver: &mut D) -> Result<Vec<Row>> {
        memoize!(self, "rows", (), self.target.rows(driver))
    }

    pub async fn key_rows<D: Driver>(
        &mut self,
        driver: &mut D,
        key_field: &str,
    ) -> Result<BTreeMap<String, Row>> {
        memoize!(self, "key_rows", key_field, self.target.key_rows(driver, key_field))
    }

    /// Cached as rows, deserialized on every call.
    pub async fn object<D: Driver, O: DeserializeOwned>(
        &mut self,
        driver: &mut D,
    ) -> Result<Option<O>> {
        self.row(driver).await?.map(|row| row.to_object()).transpose()
    }

    pub async fn objects<D: Driver, O: DeserializeOwned>(
        &mut self,
        driver: &mut D,
    ) -> Result<Vec<O>> {
        self.rows(driver).await?.iter().map(Row::to_object).collect()
    }

    pub async fn key_objects<D: Driver, O: DeserializeOwned>(
        &mut self,
        driver: &mut D,
        key_field: &str,
    ) -> Result<BTreeMap<String, O>> {
        self.key_rows(driver, key_field)
            .await?
            .into_iter()
            .map(|(key, row)| Ok((key, row.to_object()?)))
            .collect()
    }

    pub async fn count<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<i64> {
        memoize!(self, "count", field, self.target.count(driver, field))
    }

    pub async fn sum<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<Option<f64>> {
        memoize!(self, "sum", field, self.target.sum(driver, field))
    }

    pub async fn avg<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<Option<f64>> {
        memoize!(self, "avg", field, self.target.avg(driver, field))
    }

    pub async fn min<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        memoize!(self, "min", field, self.target.min(driver, field))
    }

    pub async fn max<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        memoize!(self, "max", field, self.target.max(driver, field))
    }

    pub async fn update<D: Driver>(&mut self, driver: &mut D, values: &Row) -> Result<&mut Self> {
        let outcome = self.target.update(driver, values).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn set_null<D: Driver>(
        &mut self,
        driver: &mut D,
        fields: &[&str],
    ) -> Result<&mut Self> {
        let outcome = self.target.set_null(driver, fields).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn increment<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let outcome = self.target.increment(driver, field, step).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn decrement<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let outcome = self.target.decrement(driver, field, step).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn delete<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let outcome = self.target.delete(driver).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn truncate<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let outcome = self.target.truncate(driver).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn drop<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let outcome = self.target.drop(driver).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }
}

impl<B: CacheBackend> CacheProxy<Tuple, B> {
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&SqlValue> {
        self.target.get(field)
    }

    /// # Errors
    ///
    /// Returns [`DbError::UnknownField`] for fields the table does not have.
    pub fn set(&mut self, field: &str, value: impl ToSqlValue) -> Result<&mut Self> {
        self.target.set(field, value)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`DbError::UnknownField`] for fields the table does not have.
    pub fn set_null(&mut self, field: &str) -> Result<&mut Self> {
        self.target.set_null(field)?;
        Ok(self)
    }

    pub fn bind(&mut self, source: &Row) -> &mut Self {
        self.target.bind(source);
        self
    }

    pub async fn find<D: Driver>(
        &mut self,
        driver: &mut D,
        lookup: impl Into<Lookup>,
    ) -> Result<Row> {
        let lookup = lookup.into();
        memoize!(self, "find", lookup, self.target.find(driver, lookup.clone()))
    }

    /// Binds the (possibly cached) row matching `lookup`.
    pub async fn load<D: Driver>(
        &mut self,
        driver: &mut D,
        lookup: impl Into<Lookup>,
    ) -> Result<&mut Self> {
        let row = self.find(driver, lookup).await?;
        self.target.fill(&row);
        Ok(self)
    }

    pub async fn save<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let outcome = self.target.save(driver).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn delete<D: Driver>(
        &mut self,
        driver: &mut D,
        id: Option<SqlValue>,
    ) -> Result<&mut Self> {
        let outcome = self.target.delete(driver, id).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn increment<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let outcome = self.target.increment(driver, field, step).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }

    pub async fn decrement<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let outcome = self.target.decrement(driver, field, step).await.map(|_| ());
        self.invalidate().await?;
        outcome.map(|()| self)
    }
}

impl<B: CacheBackend> CacheProxy<SqliteDriver, B> {
    pub async fn value(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Option<SqlValue>> {
        memoize!(self, "value", (sql, binds), self.target.value(sql, binds))
    }

    pub async fn values(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Vec<SqlValue>> {
        memoize!(self, "values", (sql, binds), self.target.values(sql, binds))
    }

    pub async fn key_values(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<BTreeMap<String, SqlValue>> {
        memoize!(self, "key_values", (sql, binds), self.target.key_values(sql, binds))
    }

    pub async fn row(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Option<Row>> {
        memoize!(self, "row", (sql, binds), self.target.row(sql, binds))
    }

    pub async fn rows(&mut self, sql: &str, binds: &[SqlValue]) -> Result<Vec<Row>> {
        memoize!(self, "rows", (sql, binds), self.target.rows(sql, binds))
    }

    pub async fn key_rows(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
        key: &str,
    ) -> Result<BTreeMap<String, Row>> {
        memoize!(self, "key_rows", (sql, binds, key), self.target.key_rows(sql, binds, key))
    }

    pub async fn tables(&mut self) -> Result<Vec<String>> {
        memoize!(self, "tables", (), self.target.tables())
    }

    pub async fn table_fields(&mut self, table: &str) -> Result<Vec<FieldMeta>> {
        memoize!(self, "table_fields", table, self.target.table_fields(table))
    }

    pub async fn version(&mut self) -> Result<String> {
        memoize!(self, "version", (), self.target.version())
    }

    /// Runs `sql` as a fresh statement.
    pub async fn execute(&mut self, sql: &str, binds: &[SqlValue]) -> Result<u64> {
        let outcome = self.target.execute(Some(sql), binds).await;
        self.invalidate().await?;
        outcome
    }

    pub async fn insert(&mut self, table: &str, record: &Row) -> Result<u64> {
        let outcome = self.target.insert(table, record).await;
        self.invalidate().await?;
        outcome
    }

    pub async fn insert_batch(&mut self, table: &str, records: &[Row]) -> Result<u64> {
        let outcome = self.target.insert_batch(table, records).await;
        self.invalidate().await?;
        outcome
    }

    pub async fn update(
        &mut self,
        table: &str,
        record: &Row,
        primary_key: &str,
        set_null: &[String],
    ) -> Result<u64> {
        let outcome = self.target.update(table, record, primary_key, set_null).await;
        self.invalidate().await?;
        outcome
    }

    pub async fn drop_table(&mut self, table: &str) -> Result<()> {
        let outcome = self.target.drop_table(table).await;
        self.invalidate().await?;
        outcome
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.target.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.target.commit().await
    }

    /// Also invalidates: entries cached inside the transaction may hold
    /// rolled-back rows.
    pub async fn rollback(&mut self) -> Result<()> {
        let outcome = self.target.rollback().await;
        self.invalidate().await?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use keel_sql_core::Operator;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::schema::{FieldMeta, TableMeta};

    fn users_meta() -> Arc<TableMeta> {
        Arc::new(
            TableMeta::new("users")
                .with_field(FieldMeta::new("id", "INTEGER"))
                .with_field(FieldMeta::new("name", "TEXT"))
                .with_field(FieldMeta::new("age", "INTEGER")),
        )
    }

    async fn setup() -> SqliteDriver {
        let mut driver = SqliteDriver::memory();
        driver
            .execute(
                Some("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)"),
                &[],
            )
            .await
            .unwrap();
        for (name, age) in [("Tom", 17), ("Ann", 25)] {
            driver
                .insert("users", &Row::new().with("name", name).with("age", age))
                .await
                .unwrap();
        }
        driver
    }

    #[tokio::test]
    async fn test_reads_are_memoized_until_a_write() {
        let mut driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut users = CacheProxy::new(Table::new("memory", users_meta()), Arc::clone(&backend));

        users.where_op("age", Operator::Gt, 18);
        assert_eq!(users.count(&mut driver, "*").await.unwrap(), 1);

        // Behind the proxy's back: the memo still answers.
        driver
            .insert("users", &Row::new().with("name", "Bob").with("age", 40))
            .await
            .unwrap();
        assert_eq!(users.count(&mut driver, "*").await.unwrap(), 1);

        users
            .increment(&mut driver, "age", 1)
            .await
            .unwrap();
        assert_eq!(users.count(&mut driver, "*").await.unwrap(), 2);
        let generation = backend.get("keel:memory:users:generation").await.unwrap();
        assert_eq!(generation.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_query_state_is_part_of_the_key() {
        let mut driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut users = CacheProxy::new(Table::new("memory", users_meta()), backend);

        let all = users.values(&mut driver, "name").await.unwrap();
        assert_eq!(all.len(), 2);

        users.where_eq("name", "Ann");
        let ann = users.values(&mut driver, "name").await.unwrap();
        assert_eq!(ann, vec![SqlValue::Text(String::from("Ann"))]);

        let rows = users.key_rows(&mut driver, "name").await.unwrap();
        assert_eq!(rows["Ann"].get("age"), Some(&SqlValue::Int(25)));
    }

    #[tokio::test]
    async fn test_tuple_writes_invalidate_loads() {
        let mut driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut tom = CacheProxy::new(Tuple::new("memory", users_meta()), Arc::clone(&backend));

        tom.load(&mut driver, 1).await.unwrap();
        assert_eq!(tom.get("age"), Some(&SqlValue::Int(17)));

        driver
            .execute(Some("UPDATE users SET age = 99 WHERE id = 1"), &[])
            .await
            .unwrap();
        tom.load(&mut driver, 1).await.unwrap();
        assert_eq!(tom.get("age"), Some(&SqlValue::Int(17)));

        tom.increment(&mut driver, "age", 1).await.unwrap();
        tom.load(&mut driver, 1).await.unwrap();
        assert_eq!(tom.get("age"), Some(&SqlValue::Int(100)));

        let found = tom.find(&mut driver, ("name", "Tom")).await.unwrap();
        assert_eq!(found.get("id"), Some(&SqlValue::Int(1)));
        tom.set("name", "Thomas").unwrap();
        tom.save(&mut driver).await.unwrap();
        assert!(matches!(
            tom.find(&mut driver, ("name", "Tom")).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_generic_driver_calls_and_allow_list() {
        let driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut proxy = CacheProxy::new(driver, backend);
        let sql = "SELECT name FROM users ORDER BY id";

        let first: Vec<SqlValue> = proxy
            .read(&mut (), "values", sql, |driver, _| {
                Box::pin(async move { driver.values(sql, &[]).await })
            })
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        proxy
            .target_mut()
            .insert("users", &Row::new().with("name", "Bob"))
            .await
            .unwrap();
        let stale: Vec<SqlValue> = proxy
            .read(&mut (), "values", sql, |driver, _| {
                Box::pin(async move { driver.values(sql, &[]).await })
            })
            .await
            .unwrap();
        assert_eq!(stale, first);

        let affected = proxy
            .write(&mut (), "execute", |driver, _| {
                Box::pin(async move {
                    driver
                        .execute(Some("DELETE FROM users WHERE id = 1"), &[])
                        .await
                })
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);
        let fresh: Vec<SqlValue> = proxy
            .read(&mut (), "values", sql, |driver, _| {
                Box::pin(async move { driver.values(sql, &[]).await })
            })
            .await
            .unwrap();
        assert_eq!(fresh.len(), 2);

        let err = proxy
            .read(&mut (), "execute", sql, |driver, _| {
                Box::pin(async move { driver.execute(Some(sql), &[]).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation { .. }));
        let err = proxy
            .write(&mut (), "rows", |driver, _| {
                Box::pin(async move { driver.rows(sql, &[]).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::UnsupportedOperation { operation, .. } if operation == "rows"
        ));
    }

    #[tokio::test]
    async fn test_driver_writes_through_the_proxy_invalidate() {
        let driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut proxy = CacheProxy::new(driver, backend);
        let count = "SELECT COUNT(*) FROM users WHERE age > ?";
        let adults = [SqlValue::Int(18)];

        assert_eq!(proxy.value(count, &adults).await.unwrap(), Some(SqlValue::Int(1)));

        proxy
            .insert("users", &Row::new().with("name", "Bob").with("age", 40))
            .await
            .unwrap();
        assert_eq!(proxy.value(count, &adults).await.unwrap(), Some(SqlValue::Int(2)));

        let tom = [SqlValue::Text(String::from("Tom"))];
        proxy
            .execute("UPDATE users SET age = 30 WHERE name = ?", &tom)
            .await
            .unwrap();
        assert_eq!(proxy.value(count, &adults).await.unwrap(), Some(SqlValue::Int(3)));

        proxy.begin().await.unwrap();
        proxy.execute("DELETE FROM users", &[]).await.unwrap();
        assert_eq!(proxy.value(count, &adults).await.unwrap(), Some(SqlValue::Int(0)));
        proxy.rollback().await.unwrap();
        assert_eq!(proxy.value(count, &adults).await.unwrap(), Some(SqlValue::Int(3)));

        assert_eq!(proxy.tables().await.unwrap(), vec![String::from("users")]);
        proxy.drop_table("users").await.unwrap();
        assert!(proxy.tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidation_removes_retired_entries() {
        let mut driver = setup().await;
        let backend = Arc::new(MemoryCache::new());
        let mut users = CacheProxy::new(Table::new("memory", users_meta()), Arc::clone(&backend));

        for _ in 0..1000 {
            users.count(&mut driver, "*").await.unwrap();
            users.increment(&mut driver, "age", 1).await.unwrap();
            assert!(backend.len() <= 2);
        }
        // Only the generation counter is left.
        assert_eq!(backend.len(), 1);
        assert_eq!(users.max(&mut driver, "age").await.unwrap(), Some(SqlValue::Int(1025)));
    }

    struct Counter {
        calls: u32,
    }

    impl Cacheable for Counter {
        const READ_OPERATIONS: &'static [&'static str] = &["calls"];
        const WRITE_OPERATIONS: &'static [&'static str] = &[];

        fn cache_namespace(&self) -> String {
            String::from("test:counter")
        }

        fn cache_identity(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    async fn calls(proxy: &mut CacheProxy<Counter, MemoryCache>) -> u32 {
        proxy
            .read(&mut (), "calls", &(), |counter, _| {
                Box::pin(async move {
                    counter.calls += 1;
                    Ok(counter.calls)
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_recomputed() {
        let backend = Arc::new(MemoryCache::new());
        let mut proxy = CacheProxy::new(Counter { calls: 0 }, Arc::clone(&backend))
            .with_expire(Some(Duration::from_secs(30)));

        assert_eq!(calls(&mut proxy).await, 1);
        assert_eq!(calls(&mut proxy).await, 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(calls(&mut proxy).await, 2);

        let key = "keel:test:counter:0:calls::null";
        backend.set(key, "not json", None).await.unwrap();
        assert_eq!(calls(&mut proxy).await, 3);
        assert_eq!(proxy.target().calls, 3);
    }
}
