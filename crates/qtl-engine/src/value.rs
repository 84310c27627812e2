use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use qtl_query::QueryBuilder;
use serde_json::Number;
use serde_json::Value as JsonValue;

/// A runtime template value.
///
/// Semantics follow loosely typed template languages: `undefined` and `null`
/// render as empty text, any value has a truthiness, and integral results of
/// arithmetic stay integers.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Builder(Arc<QueryBuilder>),
}

impl Value {
    /// Wraps a float, narrowing integral values to [`Value::Int`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn number(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            Value::Int(value as i64)
        } else {
            Value::Float(value)
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0 && !value.is_nan(),
            Value::String(value) => !value.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Builder(_) => true,
        }
    }

    /// Name reported by the `typeof` filter.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Builder(_) => "object",
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            Value::Bool(value) => Some(f64::from(u8::from(*value))),
            Value::Null => Some(0.0),
            Value::String(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    Some(0.0)
                } else {
                    trimmed.parse().ok()
                }
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_builder(&self) -> Option<&Arc<QueryBuilder>> {
        match self {
            Value::Builder(builder) => Some(builder),
            _ => None,
        }
    }

    /// Text produced when the value is written to template output.
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Converts to JSON for binding or serialization. `undefined` becomes
    /// `null`; builders have no JSON form.
    #[must_use]
    pub fn to_json(&self) -> Option<JsonValue> {
        Some(match self {
            Value::Undefined | Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Int(value) => JsonValue::from(*value),
            Value::Float(value) => Number::from_f64(*value).map_or(JsonValue::Null, JsonValue::Number),
            Value::String(value) => JsonValue::String(value.clone()),
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(Value::to_json).collect::<Option<_>>()?)
            }
            Value::Object(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(key, value)| Some((key.clone(), value.to_json()?)))
                    .collect::<Option<_>>()?,
            ),
            Value::Builder(_) => return None,
        })
    }

    /// Attribute or index access; missing members are `undefined`.
    #[must_use]
    pub fn get_attr(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Object(entries), key) => entries.get(&key.render()).cloned().unwrap_or_default(),
            (Value::Array(items), Value::Int(index)) => usize::try_from(*index)
                .ok()
                .and_then(|index| items.get(index))
                .cloned()
                .unwrap_or_default(),
            (Value::Array(items), Value::String(name)) if name == "length" => {
                Value::Int(i64::try_from(items.len()).unwrap_or(i64::MAX))
            }
            (Value::String(text), Value::String(name)) if name == "length" => {
                Value::Int(i64::try_from(text.chars().count()).unwrap_or(i64::MAX))
            }
            (Value::String(text), Value::Int(index)) => usize::try_from(*index)
                .ok()
                .and_then(|index| text.chars().nth(index))
                .map_or(Value::Undefined, |c| Value::String(c.to_string())),
            _ => Value::Undefined,
        }
    }

    /// Loose equality: numbers compare by value across representations and
    /// `null` equals `undefined`.
    #[must_use]
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::String(left), Value::String(right)) => left == right,
            (Value::Array(left), Value::Array(right)) => {
                left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.loose_eq(r))
            }
            (Value::Object(left), Value::Object(right)) => {
                left.len() == right.len()
                    && left
                        .iter()
                        .all(|(key, value)| right.get(key).is_some_and(|other| value.loose_eq(other)))
            }
            (Value::Builder(left), Value::Builder(right)) => Arc::ptr_eq(left, right),
            (left, right) => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            },
        }
    }

    /// Ordering for comparison operators: strings lexically, otherwise
    /// numerically.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::Null => Ok(()),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => {
                if value.is_nan() {
                    f.write_str("NaN")
                } else if value.is_infinite() {
                    f.write_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
                } else {
                    write!(f, "{value}")
                }
            }
            Value::String(value) => f.write_str(value),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Object(_) | Value::Builder(_) => f.write_str("[object Object]"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Value::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Value::Float(value) => f.debug_tuple("Float").field(value).finish(),
            Value::String(value) => f.debug_tuple("String").field(value).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            Value::Builder(builder) => f.debug_tuple("Builder").field(&builder.statement()).finish(),
        }
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(value) => Value::Bool(value),
            JsonValue::Number(number) => match number.as_i64() {
                Some(value) => Value::Int(value),
                None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(value) => Value::String(value),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
