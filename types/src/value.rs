//! Type tags and value conversion for globals.
//!
//! Values are plain [`serde_json::Value`]s. A [`TypeTag`] decides which values
//! a global may hold and how foreign values are coerced into that shape.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Boolean,
    Integer,
    Number,
    String,
    #[serde(rename = "datetime")]
    DateTime,
    Table,
    Json,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot convert {found} to {target}")]
pub struct ConversionError {
    target: TypeTag,
    found: String,
}

impl ConversionError {
    fn new(target: TypeTag, value: &Value) -> Self {
        let found = match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("boolean {b}"),
            Value::Number(n) => format!("number {n}"),
            Value::String(s) => format!("string {s:?}"),
            Value::Array(_) => "array".to_string(),
            Value::Object(_) => "object".to_string(),
        };
        Self { target, found }
    }

    #[must_use]
    pub fn target(&self) -> TypeTag {
        self.target
    }
}

impl TypeTag {
    pub const ALL: [TypeTag; 7] = [
        TypeTag::Boolean,
        TypeTag::Integer,
        TypeTag::Number,
        TypeTag::String,
        TypeTag::DateTime,
        TypeTag::Table,
        TypeTag::Json,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Boolean => "boolean",
            TypeTag::Integer => "integer",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::DateTime => "datetime",
            TypeTag::Table => "table",
            TypeTag::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "boolean" | "bool" => Some(TypeTag::Boolean),
            "integer" | "int" => Some(TypeTag::Integer),
            "number" | "float" | "double" => Some(TypeTag::Number),
            "string" | "text" => Some(TypeTag::String),
            "datetime" | "date" | "timestamp" => Some(TypeTag::DateTime),
            "table" => Some(TypeTag::Table),
            "json" | "any" => Some(TypeTag::Json),
            _ => None,
        }
    }

    /// The value a global of this type falls back to when a cast fails.
    #[must_use]
    pub fn null_value(self) -> Value {
        Value::Null
    }

    /// Coerce `value` into this type.
    ///
    /// `null` is a member of every type.
    pub fn convert(self, value: &Value) -> Result<Value, ConversionError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self {
            TypeTag::Boolean => to_boolean(value),
            TypeTag::Integer => to_integer(value),
            TypeTag::Number => to_number(value),
            TypeTag::String => Some(to_string(value)),
            TypeTag::DateTime => to_datetime(value),
            TypeTag::Table => to_table(value),
            TypeTag::Json => Some(value.clone()),
        };
        converted.ok_or_else(|| ConversionError::new(self, value))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn to_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(b) => Some(Value::Bool(*b)),
        Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn to_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(b) => Some(Value::from(i64::from(*b))),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(Value::Number(n.clone()))
            } else {
                n.as_f64().and_then(integral_f64)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .map(Value::from)
                .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
        }
        _ => None,
    }
}

fn integral_f64(f: f64) -> Option<Value> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

fn to_number(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(b) => Some(Value::from(i64::from(*b))),
        Value::Number(n) => Some(Value::Number(n.clone())),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }
        _ => None,
    }
}

/// Structural equality where numbers compare by value, so `1` equals `1.0`.
///
/// `serde_json` keeps integers and floats apart; globals do not.
#[must_use]
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || numbers_equal(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

#[allow(clippy::float_cmp)]
fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    // Only mixed integer/float pairs get here; two integers already compared.
    if x.is_f64() || y.is_f64() {
        matches!((x.as_f64(), y.as_f64()), (Some(a), Some(b)) if a == b)
    } else {
        false
    }
}

fn to_string(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.clone()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        other => Value::String(other.to_string()),
    }
}

fn to_datetime(value: &Value) -> Option<Value> {
    let parsed: DateTime<Utc> = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()?
            .with_timezone(&Utc),
        Value::Number(n) => DateTime::<Utc>::from_timestamp_millis(n.as_i64()?)?,
        _ => return None,
    };
    Some(Value::String(
        parsed.to_rfc3339_opts(SecondsFormat::Millis, true),
    ))
}

fn to_table(value: &Value) -> Option<Value> {
    match value {
        Value::Array(rows) if rows.iter().all(Value::is_object) => Some(value.clone()),
        Value::Object(columns) if columns.values().all(Value::is_array) => Some(value.clone()),
        _ => None,
    }
}

/// A type-tagged global value as shipped to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedGlobal {
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub value: Value,
}

impl SerializedGlobal {
    #[must_use]
    pub fn new(type_tag: TypeTag, value: Value) -> Self {
        Self { type_tag, value }
    }
}
