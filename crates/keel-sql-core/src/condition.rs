//! WHERE trees.
//!
//! A [`WhereClause`] is an ordered token list: predicates, nested groups,
//! trusted raw fragments and bare `AND`/`OR` connectives. Pushing a predicate
//! directly after another one inserts `AND` unless the caller supplied a
//! connective. Compilation emits `?` placeholders and the matching bind list.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialect::Dialect;
use crate::value::{SqlValue, ToSqlValue};

/// Malformed condition errors, raised while compiling a WHERE tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// `IN`/`NOT IN` with no values.
    #[error("{op} on `{field}` requires a non-empty value list")]
    EmptyList { field: String, op: Operator },

    /// `BETWEEN`/`NOT BETWEEN` without exactly two values.
    #[error("{op} on `{field}` requires exactly 2 values, got {found}")]
    BetweenArity {
        field: String,
        op: Operator,
        found: usize,
    },

    /// A list operator received a single value.
    #[error("{op} on `{field}` requires a value list")]
    ExpectedList { field: String, op: Operator },

    /// A scalar operator received a list.
    #[error("{op} on `{field}` requires a single value")]
    ExpectedScalar { field: String, op: Operator },

    /// Operator text that is not supported.
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),

    /// A bound fragment whose placeholders do not match its values.
    #[error("fragment `{sql}` has {placeholders} placeholders but {binds} values")]
    BindMismatch {
        sql: String,
        placeholders: usize,
        binds: usize,
    },

    /// Raw fragments that leave parentheses open or close too many.
    #[error("unbalanced parentheses in `{0}`")]
    Unbalanced(String),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    /// `<>`
    Ne,
    /// `!=`
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Like,
    NotLike,
    In,
    NotIn,
    Between,
    NotBetween,
}

impl Operator {
    /// Returns the SQL text.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::GtEq => ">=",
            Self::LtEq => "<=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Between => "BETWEEN",
            Self::NotBetween => "NOT BETWEEN",
        }
    }

    /// `IN` and `NOT IN`.
    #[must_use]
    pub const fn takes_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }

    /// `BETWEEN` and `NOT BETWEEN`.
    #[must_use]
    pub const fn takes_range(self) -> bool {
        matches!(self, Self::Between | Self::NotBetween)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = ConditionError;

    /// Parses operator text case-insensitively; inner whitespace is collapsed
    /// so `not  like` is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        let op = match normalized.as_str() {
            "=" | "==" => Self::Eq,
            "<>" => Self::Ne,
            "!=" => Self::NotEq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::GtEq,
            "<=" => Self::LtEq,
            "LIKE" => Self::Like,
            "NOT LIKE" => Self::NotLike,
            "IN" => Self::In,
            "NOT IN" => Self::NotIn,
            "BETWEEN" => Self::Between,
            "NOT BETWEEN" => Self::NotBetween,
            _ => return Err(ConditionError::UnknownOperator(s.to_string())),
        };
        Ok(op)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(SqlValue),
    List(Vec<SqlValue>),
}

impl Operand {
    /// Builds a list operand from any iterator of values.
    pub fn list<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToSqlValue,
    {
        Self::List(values.into_iter().map(ToSqlValue::to_sql_value).collect())
    }
}

macro_rules! scalar_operand {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Self::Value(value.to_sql_value())
                }
            }
        )*
    };
}

macro_rules! list_operand {
    ($($ty:ty),*) => {
        $(
            impl From<Vec<$ty>> for Operand {
                fn from(values: Vec<$ty>) -> Self {
                    Self::list(values)
                }
            }

            impl<const N: usize> From<[$ty; N]> for Operand {
                fn from(values: [$ty; N]) -> Self {
                    Self::list(values)
                }
            }
        )*
    };
}

scalar_operand!(
    SqlValue,
    &SqlValue,
    bool,
    i64,
    i32,
    i16,
    u32,
    u16,
    u8,
    f64,
    f32,
    String,
    &String,
    &str,
    Vec<u8>,
    Option<i64>,
    Option<String>,
    Option<&str>
);

list_operand!(SqlValue, i64, i32, u32, f64, String, &str);

/// One token of a WHERE tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Trusted SQL text, emitted verbatim.
    Raw(String),
    /// Trusted SQL text carrying its own `?` placeholders.
    Bound { sql: String, binds: Vec<SqlValue> },
    /// `field OP operand`.
    Compare {
        field: String,
        op: Operator,
        operand: Operand,
    },
    /// Parenthesized sub-tree.
    Group(Vec<Condition>),
    And,
    Or,
}

impl Condition {
    /// Wraps trusted SQL text. Bare `AND`/`OR` become connectives.
    pub fn raw(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let trimmed = sql.trim();
        if trimmed.eq_ignore_ascii_case("and") {
            Self::And
        } else if trimmed.eq_ignore_ascii_case("or") {
            Self::Or
        } else {
            Self::Raw(sql)
        }
    }

    /// Trusted SQL text with its own bind values.
    pub fn bound<I, T>(sql: impl Into<String>, binds: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToSqlValue,
    {
        Self::Bound {
            sql: sql.into(),
            binds: binds.into_iter().map(ToSqlValue::to_sql_value).collect(),
        }
    }

    /// `field = value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    /// `field OP operand`.
    pub fn compare(field: impl Into<String>, op: Operator, operand: impl Into<Operand>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            operand: operand.into(),
        }
    }

    /// Like [`Condition::compare`] with the operator given as text.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::UnknownOperator`] for unsupported operators.
    pub fn parse(
        field: impl Into<String>,
        op: &str,
        operand: impl Into<Operand>,
    ) -> Result<Self, ConditionError> {
        Ok(Self::compare(field, op.parse()?, operand))
    }

    /// Parenthesized group.
    #[must_use]
    pub const fn group(items: Vec<Self>) -> Self {
        Self::Group(items)
    }

    const fn is_connective(&self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    fn opens_predicate(&self) -> bool {
        match self {
            Self::Compare { .. } | Self::Bound { .. } | Self::Group(_) => true,
            Self::Raw(sql) => {
                let sql = sql.trim_start();
                !sql.starts_with(')') && !starts_with_word(sql, &["AND", "OR"])
            }
            Self::And | Self::Or => false,
        }
    }

    fn closes_predicate(&self) -> bool {
        match self {
            Self::Compare { .. } | Self::Bound { .. } | Self::Group(_) => true,
            Self::Raw(sql) => {
                let sql = sql.trim_end();
                !sql.ends_with('(') && !ends_with_word(sql, &["AND", "OR", "NOT"])
            }
            Self::And | Self::Or => false,
        }
    }
}

impl From<&str> for Condition {
    fn from(sql: &str) -> Self {
        Self::raw(sql)
    }
}

impl From<String> for Condition {
    fn from(sql: String) -> Self {
        Self::raw(sql)
    }
}

impl From<Vec<Self>> for Condition {
    fn from(items: Vec<Self>) -> Self {
        Self::Group(items)
    }
}

fn starts_with_word(sql: &str, words: &[&str]) -> bool {
    sql.split_whitespace()
        .next()
        .is_some_and(|first| words.iter().any(|w| first.eq_ignore_ascii_case(w)))
}

fn ends_with_word(sql: &str, words: &[&str]) -> bool {
    sql.split_whitespace()
        .next_back()
        .is_some_and(|last| words.iter().any(|w| last.eq_ignore_ascii_case(w)))
}

/// Counts `?` placeholders and the parenthesis balance of `sql`, ignoring
/// quoted literals and identifiers.
fn scan(sql: &str) -> (usize, i64) {
    let mut placeholders = 0;
    let mut depth = 0_i64;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '?' => placeholders += 1,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            },
        }
    }
    (placeholders, depth)
}

/// An ordered WHERE token list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    tokens: Vec<Condition>,
}

impl WhereClause {
    #[must_use]
    pub const fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Appends a token, normalizing nested groups and connectives.
    ///
    /// A leading connective is dropped, a connective following another one
    /// replaces it, and `AND` is inserted between two adjacent predicates.
    pub fn push(&mut self, condition: Condition) {
        let condition = match condition {
            Condition::Group(items) => {
                let mut inner = Self::new();
                for item in items {
                    inner.push(item);
                }
                inner.trim_trailing_connective();
                if inner.tokens.is_empty() {
                    return;
                }
                Condition::Group(inner.tokens)
            }
            Condition::Raw(sql) if sql.trim().is_empty() => return,
            other => other,
        };

        if condition.is_connective() {
            match self.tokens.last() {
                None => {}
                Some(last) if last.is_connective() => {
                    let len = self.tokens.len();
                    self.tokens[len - 1] = condition;
                }
                Some(_) => self.tokens.push(condition),
            }
            return;
        }

        if condition.opens_predicate()
            && self.tokens.last().is_some_and(Condition::closes_predicate)
        {
            self.tokens.push(Condition::And);
        }
        self.tokens.push(condition);
    }

    fn trim_trailing_connective(&mut self) {
        if self.tokens.last().is_some_and(Condition::is_connective) {
            self.tokens.pop();
        }
    }

    /// Returns the tokens in order.
    #[must_use]
    pub fn tokens(&self) -> &[Condition] {
        &self.tokens
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// Compiles the tree into `sql`, appending bind values in placeholder
    /// order. Nothing is written for an empty tree.
    ///
    /// # Errors
    ///
    /// Returns a [`ConditionError`] for arity violations, bound fragments
    /// whose placeholders do not match their values, or unbalanced raw
    /// parentheses.
    pub fn compile(
        &self,
        dialect: &dyn Dialect,
        sql: &mut String,
        binds: &mut Vec<SqlValue>,
    ) -> Result<(), ConditionError> {
        let mut out = String::new();
        let mut depth = 0_i64;
        compile_tokens(&self.tokens, dialect, &mut out, binds, &mut depth)?;
        if depth != 0 {
            return Err(ConditionError::Unbalanced(out));
        }
        sql.push_str(&out);
        Ok(())
    }
}

fn compile_tokens(
    tokens: &[Condition],
    dialect: &dyn Dialect,
    out: &mut String,
    binds: &mut Vec<SqlValue>,
    depth: &mut i64,
) -> Result<(), ConditionError> {
    let end = if tokens.last().is_some_and(Condition::is_connective) {
        tokens.len() - 1
    } else {
        tokens.len()
    };
    for (i, token) in tokens[..end].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match token {
            Condition::And => out.push_str("AND"),
            Condition::Or => out.push_str("OR"),
            Condition::Raw(sql) => {
                let (_, delta) = scan(sql);
                *depth += delta;
                if *depth < 0 {
                    return Err(ConditionError::Unbalanced(sql.clone()));
                }
                out.push_str(sql.trim());
            }
            Condition::Bound { sql, binds: values } => {
                let (placeholders, delta) = scan(sql);
                if placeholders != values.len() {
                    return Err(ConditionError::BindMismatch {
                        sql: sql.clone(),
                        placeholders,
                        binds: values.len(),
                    });
                }
                if delta != 0 {
                    return Err(ConditionError::Unbalanced(sql.clone()));
                }
                out.push_str(sql.trim());
                binds.extend(values.iter().cloned());
            }
            Condition::Compare { field, op, operand } => {
                compile_compare(field, *op, operand, dialect, out, binds)?;
            }
            Condition::Group(items) => {
                out.push('(');
                let mut inner = 0_i64;
                compile_tokens(items, dialect, out, binds, &mut inner)?;
                if inner != 0 {
                    return Err(ConditionError::Unbalanced(out.clone()));
                }
                out.push(')');
            }
        }
    }
    Ok(())
}

fn compile_compare(
    field: &str,
    op: Operator,
    operand: &Operand,
    dialect: &dyn Dialect,
    out: &mut String,
    binds: &mut Vec<SqlValue>,
) -> Result<(), ConditionError> {
    let placeholder = dialect.parameter_placeholder();
    out.push_str(&dialect.quote_identifier(field));
    out.push(' ');
    out.push_str(op.as_sql());

    if op.takes_list() {
        let Operand::List(values) = operand else {
            return Err(ConditionError::ExpectedList {
                field: field.to_string(),
                op,
            });
        };
        if values.is_empty() {
            return Err(ConditionError::EmptyList {
                field: field.to_string(),
                op,
            });
        }
        let marks = vec![placeholder; values.len()].join(",");
        out.push_str(&format!(" ({marks})"));
        binds.extend(values.iter().cloned());
    } else if op.takes_range() {
        let Operand::List(values) = operand else {
            return Err(ConditionError::ExpectedList {
                field: field.to_string(),
                op,
            });
        };
        if values.len() != 2 {
            return Err(ConditionError::BetweenArity {
                field: field.to_string(),
                op,
                found: values.len(),
            });
        }
        out.push_str(&format!(" {placeholder} AND {placeholder}"));
        binds.extend(values.iter().cloned());
    } else {
        let Operand::Value(value) = operand else {
            return Err(ConditionError::ExpectedScalar {
                field: field.to_string(),
                op,
            });
        };
        out.push(' ');
        out.push_str(placeholder);
        binds.push(value.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::GenericDialect;

    fn compile(clause: &WhereClause) -> Result<(String, Vec<SqlValue>), ConditionError> {
        let mut sql = String::new();
        let mut binds = Vec::new();
        clause.compile(&GenericDialect::new(), &mut sql, &mut binds)?;
        Ok((sql, binds))
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("between".parse::<Operator>(), Ok(Operator::Between));
        assert_eq!("not   like".parse::<Operator>(), Ok(Operator::NotLike));
        assert_eq!("<>".parse::<Operator>(), Ok(Operator::Ne));
        assert!(matches!(
            "~=".parse::<Operator>(),
            Err(ConditionError::UnknownOperator(_))
        ));
    }

    #[test]
    fn test_between_renders_two_placeholders() {
        let mut clause = WhereClause::new();
        clause.push(Condition::compare("age", Operator::Between, [18, 30]));
        let (sql, binds) = compile(&clause).unwrap();
        assert_eq!(sql, "\"age\" BETWEEN ? AND ?");
        assert_eq!(binds, vec![SqlValue::Int(18), SqlValue::Int(30)]);
    }

    #[test]
    fn test_between_arity() {
        let mut clause = WhereClause::new();
        clause.push(Condition::compare("age", Operator::NotBetween, [1, 2, 3]));
        assert!(matches!(
            compile(&clause),
            Err(ConditionError::BetweenArity { found: 3, .. })
        ));
    }

    #[test]
    fn test_empty_in_fails() {
        let mut clause = WhereClause::new();
        clause.push(Condition::compare("id", Operator::In, Vec::<i64>::new()));
        assert!(matches!(
            compile(&clause),
            Err(ConditionError::EmptyList { op: Operator::In, .. })
        ));
    }

    #[test]
    fn test_in_expands_placeholders() {
        let mut clause = WhereClause::new();
        clause.push(Condition::compare("id", Operator::NotIn, [1, 2, 3]));
        let (sql, binds) = compile(&clause).unwrap();
        assert_eq!(sql, "\"id\" NOT IN (?,?,?)");
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn test_operand_shape_mismatch() {
        let mut clause = WhereClause::new();
        clause.push(Condition::compare("id", Operator::In, 4));
        assert!(matches!(
            compile(&clause),
            Err(ConditionError::ExpectedList { .. })
        ));

        let mut clause = WhereClause::new();
        clause.push(Condition::compare("id", Operator::Gt, [1, 2]));
        assert!(matches!(
            compile(&clause),
            Err(ConditionError::ExpectedScalar { .. })
        ));
    }

    #[test]
    fn test_and_inserted_between_predicates() {
        let mut clause = WhereClause::new();
        clause.push(Condition::eq("a", 1));
        clause.push(Condition::eq("b", 2));
        clause.push(Condition::raw("c IS NULL"));
        let (sql, _) = compile(&clause).unwrap();
        assert_eq!(sql, "\"a\" = ? AND \"b\" = ? AND c IS NULL");
    }

    #[test]
    fn test_explicit_connective_suppresses_and() {
        let mut clause = WhereClause::new();
        clause.push(Condition::eq("a", 1));
        clause.push(Condition::raw("OR"));
        clause.push(Condition::eq("b", 2));
        let (sql, _) = compile(&clause).unwrap();
        assert_eq!(sql, "\"a\" = ? OR \"b\" = ?");
    }

    #[test]
    fn test_connective_normalization() {
        let mut clause = WhereClause::new();
        clause.push(Condition::Or);
        clause.push(Condition::eq("a", 1));
        clause.push(Condition::And);
        clause.push(Condition::Or);
        let (sql, _) = compile(&clause).unwrap();
        assert_eq!(clause.tokens(), &[Condition::eq("a", 1), Condition::Or]);
        assert_eq!(sql, "\"a\" = ?");
    }

    #[test]
    fn test_nested_groups() {
        let mut clause = WhereClause::new();
        clause.push(Condition::eq("status", "active"));
        clause.push(Condition::group(vec![
            Condition::compare("age", Operator::Lt, 18),
            Condition::Or,
            Condition::group(vec![
                Condition::compare("age", Operator::GtEq, 65),
                Condition::compare("role", Operator::In, ["admin", "staff"]),
            ]),
        ]));
        let (sql, binds) = compile(&clause).unwrap();
        assert_eq!(
            sql,
            "\"status\" = ? AND (\"age\" < ? OR (\"age\" >= ? AND \"role\" IN (?,?)))"
        );
        assert_eq!(binds.len(), sql.matches('?').count());
    }

    #[test]
    fn test_empty_group_is_skipped() {
        let mut clause = WhereClause::new();
        clause.push(Condition::eq("a", 1));
        clause.push(Condition::group(vec![Condition::Or]));
        assert_eq!(clause.tokens().len(), 1);
    }

    #[test]
    fn test_raw_parentheses_tracking() {
        let mut clause = WhereClause::new();
        clause.push(Condition::eq("a", 1));
        clause.push(Condition::raw("("));
        clause.push(Condition::eq("b", 2));
        clause.push(Condition::raw("OR"));
        clause.push(Condition::eq("c", 3));
        clause.push(Condition::raw(")"));
        let (sql, _) = compile(&clause).unwrap();
        assert_eq!(sql, "\"a\" = ? AND ( \"b\" = ? OR \"c\" = ? )");

        let mut open = WhereClause::new();
        open.push(Condition::raw("(a = 1"));
        assert!(matches!(compile(&open), Err(ConditionError::Unbalanced(_))));
    }

    #[test]
    fn test_quoted_parentheses_ignored() {
        let mut clause = WhereClause::new();
        clause.push(Condition::raw("name = ':-('"));
        assert!(compile(&clause).is_ok());
    }

    #[test]
    fn test_bound_fragment() {
        let mut clause = WhereClause::new();
        clause.push(Condition::bound("score > ? AND score < ?", [10, 20]));
        clause.push(Condition::eq("x", "y"));
        let (sql, binds) = compile(&clause).unwrap();
        assert_eq!(sql, "score > ? AND score < ? AND \"x\" = ?");
        assert_eq!(binds.len(), 3);

        let mut bad = WhereClause::new();
        bad.push(Condition::bound("a = ? AND b = ?", [1]));
        assert!(matches!(
            compile(&bad),
            Err(ConditionError::BindMismatch { placeholders: 2, binds: 1, .. })
        ));
    }
}
