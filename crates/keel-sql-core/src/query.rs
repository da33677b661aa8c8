//! Query state and statement compilation.
//!
//! [`QueryState`] holds everything a multi-row query accumulates through its
//! chained methods. It compiles into [`PreparedSql`]: statement text with
//! positional placeholders plus the bind values that match them one to one.

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionError, Operand, Operator, WhereClause};
use crate::dialect::Dialect;
use crate::value::SqlValue;

/// Join kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL JOIN",
            Self::Cross => "CROSS JOIN",
        }
    }
}

/// A join clause. `on` is trusted SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub on: Option<String>,
}

impl Join {
    fn to_sql(&self, dialect: &dyn Dialect) -> String {
        let table = dialect.quote_identifier(&self.table);
        match &self.on {
            Some(on) => format!("{} {table} ON {on}", self.kind.as_sql()),
            None => format!("{} {table}", self.kind.as_sql()),
        }
    }
}

/// Sort order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order (ASC)
    Asc,
    /// Descending order (DESC)
    Desc,
}

/// An ordering specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column, or a trusted expression when `direction` is `None`.
    pub column: String,
    pub direction: Option<OrderDirection>,
}

impl OrderBy {
    /// Creates a new ascending order specification.
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: Some(OrderDirection::Asc),
        }
    }

    /// Creates a new descending order specification.
    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: Some(OrderDirection::Desc),
        }
    }

    /// Parses an order specification.
    ///
    /// Prefix with `-` for descending order: `"-created_at"`. Anything
    /// containing whitespace or a parenthesis (`"score DESC, id"`,
    /// `"RANDOM()"`) is kept as a trusted expression.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        if let Some(column) = spec.strip_prefix('-') {
            Self::desc(column)
        } else if spec.contains(char::is_whitespace) || spec.contains('(') {
            Self {
                column: spec.to_string(),
                direction: None,
            }
        } else {
            Self::asc(spec)
        }
    }

    fn to_sql(&self, dialect: &dyn Dialect) -> String {
        match self.direction {
            Some(OrderDirection::Asc) => format!("{} ASC", dialect.quote_identifier(&self.column)),
            Some(OrderDirection::Desc) => {
                format!("{} DESC", dialect.quote_identifier(&self.column))
            }
            None => self.column.clone(),
        }
    }
}

/// One `SET` entry of an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// `col = ?`
    Value(String, SqlValue),
    /// `col = NULL`
    Null(String),
    /// `col = col + ?`
    Increment(String, i64),
    /// `col = col - ?`
    Decrement(String, i64),
}

impl Assignment {
    fn compile(&self, dialect: &dyn Dialect, binds: &mut Vec<SqlValue>) -> String {
        let placeholder = dialect.parameter_placeholder();
        match self {
            Self::Value(column, value) => {
                binds.push(value.clone());
                format!("{} = {placeholder}", dialect.quote_identifier(column))
            }
            Self::Null(column) => format!("{} = NULL", dialect.quote_identifier(column)),
            Self::Increment(column, step) | Self::Decrement(column, step) => {
                let sign = if matches!(self, Self::Increment(..)) { '+' } else { '-' };
                let column = dialect.quote_identifier(column);
                binds.push(SqlValue::Int(*step));
                format!("{column} = {column} {sign} {placeholder}")
            }
        }
    }
}

/// Statement text plus its ordered bind values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedSql {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl PreparedSql {
    pub fn new(sql: impl Into<String>, binds: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            binds,
        }
    }

    /// Returns the statement with every placeholder replaced by its escaped
    /// literal. For logs and diagnostics only.
    #[must_use]
    pub fn to_inline(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut values = self.binds.iter();
        let mut quote: Option<char> = None;
        for c in self.sql.chars() {
            match quote {
                Some(q) => {
                    if c == q {
                        quote = None;
                    }
                    out.push(c);
                }
                None => match c {
                    '\'' | '"' | '`' => {
                        quote = Some(c);
                        out.push(c);
                    }
                    '?' => match values.next() {
                        Some(value) => out.push_str(&value.to_sql_inline()),
                        None => out.push('?'),
                    },
                    _ => out.push(c),
                },
            }
        }
        out
    }
}

/// Accumulated multi-row query state.
///
/// Chained methods mutate in place and return `&mut Self`. [`QueryState::init`]
/// resets everything except the table and its alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    table: String,
    alias: Option<String>,
    select: Option<String>,
    joins: Vec<Join>,
    conditions: WhereClause,
    group_by: Vec<String>,
    having: WhereClause,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryState {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn conditions(&self) -> &WhereClause {
        &self.conditions
    }

    #[must_use]
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// The select list set through [`QueryState::select`].
    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.select.as_deref()
    }

    /// Sets the table alias used by SELECT statements.
    pub fn alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.alias = Some(alias.into());
        self
    }

    /// Overrides the default select list with trusted SQL.
    pub fn select(&mut self, fields: impl Into<String>) -> &mut Self {
        self.select = Some(fields.into());
        self
    }

    pub fn join(
        &mut self,
        kind: JoinKind,
        table: impl Into<String>,
        on: Option<String>,
    ) -> &mut Self {
        self.joins.push(Join {
            kind,
            table: table.into(),
            on,
        });
        self
    }

    /// Appends any condition token.
    pub fn filter(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.conditions.push(condition.into());
        self
    }

    /// `field = value`.
    pub fn where_eq(&mut self, field: impl Into<String>, value: impl Into<Operand>) -> &mut Self {
        self.filter(Condition::eq(field, value))
    }

    /// `field OP operand`.
    pub fn where_op(
        &mut self,
        field: impl Into<String>,
        op: Operator,
        operand: impl Into<Operand>,
    ) -> &mut Self {
        self.filter(Condition::compare(field, op, operand))
    }

    /// Like [`QueryState::where_op`] with textual operator, e.g. `"not in"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::UnknownOperator`] for unsupported text.
    pub fn where_parse(
        &mut self,
        field: impl Into<String>,
        op: &str,
        operand: impl Into<Operand>,
    ) -> Result<&mut Self, ConditionError> {
        let condition = Condition::parse(field, op, operand)?;
        Ok(self.filter(condition))
    }

    /// Trusted fragment; bare `"AND"`/`"OR"` act as connectives.
    pub fn where_raw(&mut self, sql: impl Into<String>) -> &mut Self {
        self.filter(Condition::raw(sql))
    }

    /// Trusted fragment with its own placeholders.
    pub fn where_bound(&mut self, sql: impl Into<String>, binds: Vec<SqlValue>) -> &mut Self {
        self.filter(Condition::Bound {
            sql: sql.into(),
            binds,
        })
    }

    /// Parenthesized group of sub-conditions.
    pub fn where_group(&mut self, items: Vec<Condition>) -> &mut Self {
        self.filter(Condition::Group(items))
    }

    pub fn and(&mut self) -> &mut Self {
        self.filter(Condition::And)
    }

    pub fn or(&mut self) -> &mut Self {
        self.filter(Condition::Or)
    }

    pub fn group_by(&mut self, field: impl Into<String>) -> &mut Self {
        self.group_by.push(field.into());
        self
    }

    pub fn having(&mut self, condition: impl Into<Condition>) -> &mut Self {
        self.having.push(condition.into());
        self
    }

    /// Adds an ordering; see [`OrderBy::parse`].
    pub fn order_by(&mut self, spec: &str) -> &mut Self {
        self.order_by.push(OrderBy::parse(spec));
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.offset = Some(offset);
        self
    }

    /// Clears select/join/where/group/having/order/limit/offset state.
    pub fn init(&mut self) -> &mut Self {
        self.select = None;
        self.joins.clear();
        self.conditions.clear();
        self.group_by.clear();
        self.having.clear();
        self.order_by.clear();
        self.limit = None;
        self.offset = None;
        self
    }

    /// Compiles the query tail:
    /// `WHERE … GROUP BY … HAVING … ORDER BY … LIMIT … OFFSET …`.
    ///
    /// The text has no leading space and is empty when nothing is set.
    ///
    /// # Errors
    ///
    /// Propagates [`ConditionError`] from the WHERE and HAVING trees.
    pub fn prepare_sql(&self, dialect: &dyn Dialect) -> Result<PreparedSql, ConditionError> {
        let mut parts = Vec::new();
        let mut binds = Vec::new();

        if let Some(clause) = compile_clause("WHERE", &self.conditions, dialect, &mut binds)? {
            parts.push(clause);
        }
        if !self.group_by.is_empty() {
            let fields: Vec<String> = self
                .group_by
                .iter()
                .map(|f| dialect.quote_identifier(f))
                .collect();
            parts.push(format!("GROUP BY {}", fields.join(", ")));
        }
        if let Some(clause) = compile_clause("HAVING", &self.having, dialect, &mut binds)? {
            parts.push(clause);
        }
        if !self.order_by.is_empty() {
            let orders: Vec<String> = self.order_by.iter().map(|o| o.to_sql(dialect)).collect();
            parts.push(format!("ORDER BY {}", orders.join(", ")));
        }
        if let Some(limit) = dialect.limit_clause(self.limit, self.offset) {
            parts.push(limit);
        }

        Ok(PreparedSql::new(parts.join(" "), binds))
    }

    /// `SELECT <fields> FROM <table>[ AS alias][ joins][ tail]`.
    ///
    /// `fields` wins over [`QueryState::select`], which wins over `*`.
    ///
    /// # Errors
    ///
    /// Propagates [`ConditionError`].
    pub fn select_sql(
        &self,
        dialect: &dyn Dialect,
        fields: Option<&str>,
    ) -> Result<PreparedSql, ConditionError> {
        let fields = fields.or(self.select.as_deref()).unwrap_or("*");
        let tail = self.prepare_sql(dialect)?;
        let mut sql = format!("SELECT {fields} FROM {}", self.source(dialect, true));
        push_tail(&mut sql, &tail.sql);
        Ok(PreparedSql::new(sql, tail.binds))
    }

    /// `UPDATE <table>[ joins] SET … [WHERE …]`.
    ///
    /// # Errors
    ///
    /// Propagates [`ConditionError`].
    pub fn update_sql(
        &self,
        dialect: &dyn Dialect,
        assignments: &[Assignment],
    ) -> Result<PreparedSql, ConditionError> {
        let mut binds = Vec::new();
        let sets: Vec<String> = assignments
            .iter()
            .map(|a| a.compile(dialect, &mut binds))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.source(dialect, false),
            sets.join(", ")
        );
        if let Some(clause) = compile_clause("WHERE", &self.conditions, dialect, &mut binds)? {
            push_tail(&mut sql, &clause);
        }
        Ok(PreparedSql::new(sql, binds))
    }

    /// `DELETE FROM <table>[ joins][ WHERE …]`.
    ///
    /// # Errors
    ///
    /// Propagates [`ConditionError`].
    pub fn delete_sql(&self, dialect: &dyn Dialect) -> Result<PreparedSql, ConditionError> {
        let mut binds = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.source(dialect, false));
        if let Some(clause) = compile_clause("WHERE", &self.conditions, dialect, &mut binds)? {
            push_tail(&mut sql, &clause);
        }
        Ok(PreparedSql::new(sql, binds))
    }

    #[must_use]
    pub fn truncate_sql(&self, dialect: &dyn Dialect) -> PreparedSql {
        PreparedSql::new(
            dialect.truncate_sql(&dialect.quote_identifier(&self.table)),
            Vec::new(),
        )
    }

    #[must_use]
    pub fn drop_sql(&self, dialect: &dyn Dialect) -> PreparedSql {
        PreparedSql::new(
            format!("DROP TABLE {}", dialect.quote_identifier(&self.table)),
            Vec::new(),
        )
    }

    fn source(&self, dialect: &dyn Dialect, with_alias: bool) -> String {
        let mut source = dialect.quote_identifier(&self.table);
        if with_alias {
            if let Some(alias) = &self.alias {
                source.push_str(" AS ");
                source.push_str(&dialect.quote_identifier(alias));
            }
        }
        for join in &self.joins {
            source.push(' ');
            source.push_str(&join.to_sql(dialect));
        }
        source
    }
}

fn compile_clause(
    keyword: &str,
    clause: &WhereClause,
    dialect: &dyn Dialect,
    binds: &mut Vec<SqlValue>,
) -> Result<Option<String>, ConditionError> {
    if clause.is_empty() {
        return Ok(None);
    }
    let mut sql = format!("{keyword} ");
    clause.compile(dialect, &mut sql, binds)?;
    Ok(Some(sql))
}

fn push_tail(sql: &mut String, tail: &str) {
    if !tail.is_empty() {
        sql.push(' ');
        sql.push_str(tail);
    }
}
