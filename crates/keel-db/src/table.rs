//! Fluent multi-row query builder.
//!
//! A [`Table`] accumulates query state through chained methods and compiles
//! it for the driver it is run against. Reads hand the statement to the
//! driver's materializers; writes reuse the join and WHERE state and return
//! the builder for further chaining. The last statement is kept for
//! diagnostics with its values substituted in.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_sql_core::{
    Assignment, Condition, ConditionError, Dialect, JoinKind, Operand, Operator, PreparedSql,
    QueryState, SqlValue,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::driver::{Driver, RowStream};
use crate::error::Result;
use crate::row::Row;
use crate::schema::TableMeta;

/// Query builder bound to one table of one logical database.
#[derive(Debug, Clone)]
pub struct Table {
    db: String,
    meta: Arc<TableMeta>,
    state: QueryState,
    last_sql: Option<PreparedSql>,
}

impl Table {
    pub fn new(db: impl Into<String>, meta: Arc<TableMeta>) -> Self {
        let state = QueryState::new(meta.name.clone());
        Self {
            db: db.into(),
            meta,
            state,
            last_sql: None,
        }
    }

    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    #[must_use]
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    #[must_use]
    pub const fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.state.alias(alias);
        self
    }

    pub fn select(&mut self, fields: impl Into<String>) -> &mut Self {
        self.state.select(fields);
        self
    }

    pub fn join(&mut self, table: impl Into<String>, on: impl Into<String>) -> &mut Self {
        self.state.join(JoinKind::Inner, table, Some(on.into()));
        self
    }

    pub fn left_join(&mut self, table: impl Into<String>, on: impl Into<String>) -> &mut Self {
        self.state.join(JoinKind::Left, table, Some(on.into()));
        self
    }

    pub fn right_join(&mut self, table: impl Into<String>, on: impl Into<String>) -> &mut Self {
        self.state.join(JoinKind::Right, table, Some(on.into()));
        self
    }

    pub fn full_join(&mut self, table: impl Into<String>, on: impl Into<String>) -> &mut Self {
        self.state.join(JoinKind::Full, table, Some(on.into()));
        self
    }

    pub fn cross_join(&mut self, table: impl Into<String>) -> &mut Self {
        self.state.join(JoinKind::Cross, table, None);
        self
    }

    /// Appends a condition token: a predicate, a group, a raw fragment, or
    /// a bare connective.
    pub fn filter(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.state.filter(condition);
        self
    }

    pub fn where_eq(&mut self, field: impl Into<String>, value: impl Into<Operand>) -> &mut Self {
        self.state.where_eq(field, value);
        self
    }

    pub fn where_op(
        &mut self,
        field: impl Into<String>,
        op: Operator,
        operand: impl Into<Operand>,
    ) -> &mut Self {
        self.state.where_op(field, op, operand);
        self
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
        self.state.where_parse(field, op, operand)?;
        Ok(self)
    }

    pub fn where_raw(&mut self, sql: impl Into<String>) -> &mut Self {
        self.state.where_raw(sql);
        self
    }

    pub fn where_bound(&mut self, sql: impl Into<String>, binds: Vec<SqlValue>) -> &mut Self {
        self.state.where_bound(sql, binds);
        self
    }

    pub fn where_group(&mut self, items: Vec<Condition>) -> &mut Self {
        self.state.where_group(items);
        self
    }

    pub fn and(&mut self) -> &mut Self {
        self.state.and();
        self
    }

    pub fn or(&mut self) -> &mut Self {
        self.state.or();
        self
    }

    pub fn group_by(&mut self, field: impl Into<String>) -> &mut Self {
        self.state.group_by(field);
        self
    }

    pub fn having(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.state.having(condition);
        self
    }

    pub fn order_by(&mut self, spec: &str) -> &mut Self {
        self.state.order_by(spec);
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.state.limit(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.state.offset(offset);
        self
    }

    /// Clears join/where/group/having/order/limit/offset state.
    pub fn init(&mut self) -> &mut Self {
        self.state.init();
        self
    }

    /// Last statement with its values inlined. Display only.
    #[must_use]
    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.as_ref().map(PreparedSql::to_inline)
    }

    /// Quoted known fields when selecting from this table alone.
    fn default_fields(&self, dialect: &dyn Dialect) -> Option<String> {
        if self.state.selected().is_some()
            || !self.state.joins().is_empty()
            || self.meta.fields.is_empty()
        {
            return None;
        }
        let fields: Vec<String> = self
            .meta
            .field_names()
            .map(|f| dialect.quote_identifier(f))
            .collect();
        Some(fields.join(", "))
    }

    fn compile_select(
        &mut self,
        dialect: &dyn Dialect,
        fields: Option<&str>,
    ) -> Result<&PreparedSql> {
        let defaults = self.default_fields(dialect);
        let prepared = self
            .state
            .select_sql(dialect, fields.or(defaults.as_deref()))?;
        debug!(db = %self.db, table = %self.meta.name, sql = %prepared.sql, "Compiled select");
        Ok(self.last_sql.insert(prepared))
    }

    /// Value of `field` (any trusted expression) in the first matching row.
    pub async fn value<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        let prepared = self.compile_select(driver.dialect(), Some(field))?;
        driver.value(&prepared.sql, &prepared.binds).await
    }

    pub async fn values<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Vec<SqlValue>> {
        let prepared = self.compile_select(driver.dialect(), Some(field))?;
        driver.values(&prepared.sql, &prepared.binds).await
    }

    /// `key_field` mapped to `value_field` across matching rows.
    pub async fn key_values<D: Driver>(
        &mut self,
        driver: &mut D,
        key_field: &str,
        value_field: &str,
    ) -> Result<BTreeMap<String, SqlValue>> {
        let fields = format!("{key_field}, {value_field}");
        let prepared = self.compile_select(driver.dialect(), Some(&fields))?;
        driver.key_values(&prepared.sql, &prepared.binds).await
    }

    pub async fn row<D: Driver>(&mut self, driver: &mut D) -> Result<Option<Row>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.row(&prepared.sql, &prepared.binds).await
    }

    pub async fn rows<D: Driver>(&mut self, driver: &mut D) -> Result<Vec<Row>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.rows(&prepared.sql, &prepared.binds).await
    }

    pub async fn key_rows<D: Driver>(
        &mut self,
        driver: &mut D,
        key: &str,
    ) -> Result<BTreeMap<String, Row>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.key_rows(&prepared.sql, &prepared.binds, key).await
    }

    pub async fn object<D: Driver, T: DeserializeOwned>(
        &mut self,
        driver: &mut D,
    ) -> Result<Option<T>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.object(&prepared.sql, &prepared.binds).await
    }

    pub async fn objects<D: Driver, T: DeserializeOwned>(
        &mut self,
        driver: &mut D,
    ) -> Result<Vec<T>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.objects(&prepared.sql, &prepared.binds).await
    }

    pub async fn key_objects<D: Driver, T: DeserializeOwned>(
        &mut self,
        driver: &mut D,
        key: &str,
    ) -> Result<BTreeMap<String, T>> {
        let prepared = self.compile_select(driver.dialect(), None)?;
        driver.key_objects(&prepared.sql, &prepared.binds, key).await
    }

    /// Matching rows, produced lazily. The stream borrows both the builder
    /// and the driver until it is dropped.
    pub async fn stream_rows<'a, D: Driver>(
        &'a mut self,
        driver: &'a mut D,
    ) -> Result<RowStream<'a>> {
        let prepared: &'a PreparedSql = self.compile_select(driver.dialect(), None)?;
        driver.fetch_stream(&prepared.sql, &prepared.binds).await
    }

    pub async fn stream_values<'a, D: Driver>(
        &'a mut self,
        driver: &'a mut D,
        field: &str,
    ) -> Result<futures::stream::BoxStream<'a, Result<SqlValue>>> {
        let prepared: &'a PreparedSql = self.compile_select(driver.dialect(), Some(field))?;
        driver.stream_values(&prepared.sql, &prepared.binds).await
    }

    pub async fn stream_objects<'a, D: Driver, T: DeserializeOwned + Send + 'a>(
        &'a mut self,
        driver: &'a mut D,
    ) -> Result<futures::stream::BoxStream<'a, Result<T>>> {
        let prepared: &'a PreparedSql = self.compile_select(driver.dialect(), None)?;
        driver.stream_objects(&prepared.sql, &prepared.binds).await
    }

    /// `COUNT(field)`; pass `"*"` to count rows.
    pub async fn count<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<i64> {
        let expr = aggregate("COUNT", field, driver.dialect());
        let value = self.value(driver, &expr).await?;
        Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    pub async fn sum<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<Option<f64>> {
        let expr = aggregate("SUM", field, driver.dialect());
        Ok(self.value(driver, &expr).await?.and_then(|v| v.as_f64()))
    }

    pub async fn avg<D: Driver>(&mut self, driver: &mut D, field: &str) -> Result<Option<f64>> {
        let expr = aggregate("AVG", field, driver.dialect());
        Ok(self.value(driver, &expr).await?.and_then(|v| v.as_f64()))
    }

    pub async fn min<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        let expr = aggregate("MIN", field, driver.dialect());
        Ok(self.value(driver, &expr).await?.filter(|v| !v.is_null()))
    }

    pub async fn max<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
    ) -> Result<Option<SqlValue>> {
        let expr = aggregate("MAX", field, driver.dialect());
        Ok(self.value(driver, &expr).await?.filter(|v| !v.is_null()))
    }

    async fn run_write<D: Driver>(
        &mut self,
        driver: &mut D,
        prepared: PreparedSql,
    ) -> Result<&mut Self> {
        debug!(db = %self.db, table = %self.meta.name, sql = %prepared.sql, "Running write");
        let prepared = self.last_sql.insert(prepared);
        driver.execute(Some(&prepared.sql), &prepared.binds).await?;
        Ok(self)
    }

    /// Updates matching rows. Null values leave their columns unchanged;
    /// with nothing left to write no statement runs.
    pub async fn update<D: Driver>(&mut self, driver: &mut D, values: &Row) -> Result<&mut Self> {
        let assignments: Vec<Assignment> = values
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(column, value)| Assignment::Value(column.to_string(), value.clone()))
            .collect();
        if assignments.is_empty() {
            return Ok(self);
        }
        let prepared = self.state.update_sql(driver.dialect(), &assignments)?;
        self.run_write(driver, prepared).await
    }

    /// Writes SQL NULL into `fields` of matching rows.
    pub async fn set_null<D: Driver>(
        &mut self,
        driver: &mut D,
        fields: &[&str],
    ) -> Result<&mut Self> {
        let assignments: Vec<Assignment> = fields
            .iter()
            .map(|f| Assignment::Null((*f).to_string()))
            .collect();
        if assignments.is_empty() {
            return Ok(self);
        }
        let prepared = self.state.update_sql(driver.dialect(), &assignments)?;
        self.run_write(driver, prepared).await
    }

    /// `field = field + step` on matching rows, in one statement.
    pub async fn increment<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let prepared = self
            .state
            .update_sql(driver.dialect(), &[Assignment::Increment(field.to_string(), step)])?;
        self.run_write(driver, prepared).await
    }

    /// `field = field - step` on matching rows, in one statement.
    pub async fn decrement<D: Driver>(
        &mut self,
        driver: &mut D,
        field: &str,
        step: i64,
    ) -> Result<&mut Self> {
        let prepared = self
            .state
            .update_sql(driver.dialect(), &[Assignment::Decrement(field.to_string(), step)])?;
        self.run_write(driver, prepared).await
    }

    pub async fn delete<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let prepared = self.state.delete_sql(driver.dialect())?;
        self.run_write(driver, prepared).await
    }

    pub async fn truncate<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let prepared = self.state.truncate_sql(driver.dialect());
        self.run_write(driver, prepared).await
    }

    pub async fn drop<D: Driver>(&mut self, driver: &mut D) -> Result<&mut Self> {
        let prepared = self.state.drop_sql(driver.dialect());
        self.run_write(driver, prepared).await
    }
}

fn aggregate(function: &str, field: &str, dialect: &dyn Dialect) -> String {
    format!("{function}({})", dialect.quote_identifier(field))
}
