//! Filter predicates passed to data sources.
//!
//! Simple `(field, operator, value)` triples come from connection arguments.
//! Composite conditions come from cursor boundaries and batch loaders. A
//! condition can be evaluated against an in-memory row or rendered as a SQL
//! fragment for backends that want one.

use std::cmp::Ordering;
use std::fmt;

use async_graphql::Value;

use crate::datasource::Row;
use crate::{GraphQLError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
    NotLike,
}

impl Operator {
    /// Parse the GraphQL enum spelling (`EQ`, `NEQ`, `NOT_LIKE`, ...) or the
    /// symbolic form (`=`, `!=`, `not like`, ...).
    pub fn parse(name: &str) -> Result<Self> {
        let op = match name.trim().to_ascii_uppercase().as_str() {
            "EQ" | "=" => Operator::Eq,
            "NEQ" | "!=" => Operator::Ne,
            "LT" | "<" => Operator::Lt,
            "GT" | ">" => Operator::Gt,
            "LTE" | "<=" => Operator::Le,
            "GTE" | ">=" => Operator::Ge,
            "LIKE" => Operator::Like,
            "NOT_LIKE" | "NOT LIKE" => Operator::NotLike,
            other => {
                return Err(GraphQLError::PaginationError(format!(
                    "Unknown filter operator `{}`.",
                    other
                )))
            }
        };
        Ok(op)
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Like => "like",
            Operator::NotLike => "not like",
        }
    }

    /// SQL semantics: any comparison involving NULL is false.
    pub fn test(self, left: &Value, right: &Value) -> bool {
        if matches!(left, Value::Null) || matches!(right, Value::Null) {
            return false;
        }
        match self {
            Operator::Like => like(left, right),
            Operator::NotLike => !like(left, right),
            _ => {
                let Some(ordering) = compare_non_null(left, right) else {
                    return false;
                };
                match self {
                    Operator::Eq => ordering == Ordering::Equal,
                    Operator::Ne => ordering != Ordering::Equal,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::Gt => ordering == Ordering::Greater,
                    Operator::Le => ordering != Ordering::Greater,
                    Operator::Ge => ordering != Ordering::Less,
                    Operator::Like | Operator::NotLike => unreachable!(),
                }
            }
        }
    }
}

/// Predicate tree over row fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: String,
        op: Operator,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Condition>),
    /// An empty `Or` matches nothing.
    Or(Vec<Condition>),
}

impl Condition {
    pub fn compare(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Condition::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::In {
            field: field.into(),
            values,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Compare { field, op, value } => op.test(field_value(row, field), value),
            Condition::In { field, values } => {
                let actual = field_value(row, field);
                values.iter().any(|v| Operator::Eq.test(actual, v))
            }
            Condition::IsNull(field) => matches!(field_value(row, field), Value::Null),
            Condition::IsNotNull(field) => !matches!(field_value(row, field), Value::Null),
            Condition::And(conditions) => conditions.iter().all(|c| c.matches(row)),
            Condition::Or(conditions) => conditions.iter().any(|c| c.matches(row)),
        }
    }
}

impl fmt::Display for Condition {
    /// SQL-like rendering; values are written as GraphQL literals, which
    /// quote strings the same way SQL does for plain text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { field, op, value } => write!(f, "{} {} {}", field, op.as_sql(), value),
            Condition::In { field, values } => {
                let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{} IN ({})", field, rendered.join(", "))
            }
            Condition::IsNull(field) => write!(f, "{} IS NULL", field),
            Condition::IsNotNull(field) => write!(f, "{} IS NOT NULL", field),
            Condition::And(conditions) => join(f, conditions, " AND ", "1=1"),
            Condition::Or(conditions) => join(f, conditions, " OR ", "1=0"),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, conditions: &[Condition], sep: &str, empty: &str) -> fmt::Result {
    if conditions.is_empty() {
        return f.write_str(empty);
    }
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "({})", condition)?;
    }
    Ok(())
}

/// Column lookup. Table-qualified names (`table.column`) read `column`.
pub fn field_value<'r>(row: &'r Row, field: &str) -> &'r Value {
    static NULL: Value = Value::Null;
    let column = field.rsplit('.').next().unwrap_or(field);
    row.get(column).unwrap_or(&NULL)
}

/// Total order used for sorting: NULL sorts after every non-null value.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => compare_non_null(left, right).unwrap_or_else(|| type_rank(left).cmp(&type_rank(right))),
    }
}

fn compare_non_null(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Enum(a), Value::Enum(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::String(a), Value::Enum(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Enum(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Boolean(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) | Value::Enum(_) => 2,
        Value::Binary(_) => 3,
        Value::List(_) => 4,
        Value::Object(_) => 5,
        Value::Null => 6,
    }
}

fn like(value: &Value, pattern: &Value) -> bool {
    let (Some(value), Some(pattern)) = (as_text(value), as_text(pattern)) else {
        return false;
    };
    let value: Vec<char> = value.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    like_match(&value, &pattern)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Enum(name) => Some(name.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `%` matches any run of characters, `_` exactly one.
fn like_match(value: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => (0..=value.len()).any(|skip| like_match(&value[skip..], rest)),
        Some(('_', rest)) => !value.is_empty() && like_match(&value[1..], rest),
        Some((c, rest)) => value.first() == Some(c) && like_match(&value[1..], rest),
    }
}
