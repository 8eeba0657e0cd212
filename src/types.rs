//! Common GraphQL types
//!
//! Built-in leaf types and how resolver output is serialized into them.

use async_graphql::{Name, Number, Value};
use chrono::{DateTime as ChronoDateTime, NaiveDateTime, Utc};

use crate::{GraphQLError, Result};

/// DateTime scalar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateTime(pub ChronoDateTime<Utc>);

impl DateTime {
    /// Accepts RFC 3339 timestamps and the `YYYY-MM-DD HH:MM:SS[.ffffff]`
    /// form document stores usually emit (read as UTC).
    pub fn parse(value: &str) -> Result<Self> {
        if let Ok(parsed) = ChronoDateTime::parse_from_rfc3339(value) {
            return Ok(DateTime(parsed.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| DateTime(naive.and_utc()))
            .map_err(|e| GraphQLError::InvalidValue(format!("Invalid DateTime: {}", e)))
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.to_rfc3339())
    }
}

/// Leaf scalar types understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int,
    Float,
    String,
    Boolean,
    Id,
    DateTime,
    /// Any value, passed through untouched.
    Json,
}

impl ScalarKind {
    pub const BUILTINS: [ScalarKind; 7] = [
        ScalarKind::Int,
        ScalarKind::Float,
        ScalarKind::String,
        ScalarKind::Boolean,
        ScalarKind::Id,
        ScalarKind::DateTime,
        ScalarKind::Json,
    ];

    pub fn type_name(self) -> &'static str {
        match self {
            ScalarKind::Int => "Int",
            ScalarKind::Float => "Float",
            ScalarKind::String => "String",
            ScalarKind::Boolean => "Boolean",
            ScalarKind::Id => "ID",
            ScalarKind::DateTime => "DateTime",
            ScalarKind::Json => "JSON",
        }
    }

    /// Coerce a resolved value into this scalar's output form.
    pub fn serialize(self, value: &Value) -> Result<Value> {
        let serialized = match (self, value) {
            (ScalarKind::Json, value) => Some(value.clone()),

            (ScalarKind::Int, Value::Number(n)) => n.as_f64().and_then(as_int),
            (ScalarKind::Int, Value::Boolean(b)) => Some(Value::Number(Number::from(*b as i32))),
            (ScalarKind::Int, Value::String(s)) => s.trim().parse::<f64>().ok().and_then(as_int),

            (ScalarKind::Float, Value::Number(n)) => n.as_f64().and_then(as_float),
            (ScalarKind::Float, Value::Boolean(b)) => as_float(if *b { 1.0 } else { 0.0 }),
            (ScalarKind::Float, Value::String(s)) => s.trim().parse::<f64>().ok().and_then(as_float),

            (ScalarKind::String, Value::String(s)) => Some(Value::String(s.clone())),
            (ScalarKind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ScalarKind::String, Value::Boolean(b)) => Some(Value::String(b.to_string())),
            (ScalarKind::String, Value::Enum(name)) => Some(Value::String(name.to_string())),

            (ScalarKind::Boolean, Value::Boolean(b)) => Some(Value::Boolean(*b)),
            (ScalarKind::Boolean, Value::Number(n)) => n.as_f64().map(|f| Value::Boolean(f != 0.0)),

            (ScalarKind::Id, Value::String(s)) => Some(Value::String(s.clone())),
            (ScalarKind::Id, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Some(Value::String(n.to_string()))
            }

            (ScalarKind::DateTime, Value::String(s)) => Some(DateTime::parse(s)?.to_value()),

            _ => None,
        };

        serialized.ok_or_else(|| {
            GraphQLError::InvalidValue(format!(
                "{} cannot represent value: {}",
                self.type_name(),
                value
            ))
        })
    }
}

fn as_int(f: f64) -> Option<Value> {
    if f.fract() != 0.0 || f < i32::MIN as f64 || f > i32::MAX as f64 {
        return None;
    }
    Some(Value::Number(Number::from(f as i32)))
}

fn as_float(f: f64) -> Option<Value> {
    Number::from_f64(f).map(Value::Number)
}

/// Serialize `value` as a member of an enum with the given `values`.
pub fn serialize_enum(type_name: &str, values: &[String], value: &Value) -> Result<Value> {
    let name = match value {
        Value::Enum(name) => name.as_str(),
        Value::String(s) => s.as_str(),
        _ => "",
    };
    if values.iter().any(|v| v == name) {
        Ok(Value::Enum(Name::new(name)))
    } else {
        Err(GraphQLError::InvalidValue(format!(
            "Enum '{}' cannot represent value: {}",
            type_name, value
        )))
    }
}
