use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;

use super::EXECUTE_FILTER_NAME;
use super::RAW_FILTER_NAME;
use super::SANITIZER_FILTER_NAME;
use crate::context::Context;
use crate::environment::execute_builder;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::FilterArgs;
use crate::extensions::FilterBuilder;
use crate::extensions::FilterRunner;
use crate::passes::SanitizerVisitor;
use crate::value::Value;

/// Binds a value through the active parameterizer and renders its
/// placeholder instead of the value itself.
pub struct SanitizerFilter;

impl FilterBuilder for SanitizerFilter {
    fn filter_name(&self) -> &str {
        SANITIZER_FILTER_NAME
    }

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        vec![Box::new(SanitizerVisitor)]
    }
}

#[async_trait]
impl FilterRunner for SanitizerFilter {
    fn filter_name(&self) -> &str {
        SANITIZER_FILTER_NAME
    }

    async fn transform(
        &self,
        context: &mut Context,
        value: Value,
        _args: FilterArgs,
    ) -> Result<Value, EngineError> {
        if value.is_undefined() {
            return Ok(Value::String(String::new()));
        }
        let parameterizer = context
            .parameterizer()
            .map(Arc::clone)
            .ok_or_else(|| EngineError::internal("No parameterizer found"))?;
        let json = value.to_json().ok_or_else(|| {
            EngineError::internal("A query builder can't be bound as a query parameter")
        })?;

        let identifier = parameterizer.generate_identifier(&json).await?;
        Ok(Value::String(identifier))
    }
}

/// Runs a query builder and returns its rows; any other value yields its
/// `value` member.
pub struct ExecuteFilter;

impl FilterBuilder for ExecuteFilter {
    fn filter_name(&self) -> &str {
        EXECUTE_FILTER_NAME
    }
}

#[async_trait]
impl FilterRunner for ExecuteFilter {
    fn filter_name(&self) -> &str {
        EXECUTE_FILTER_NAME
    }

    async fn transform(
        &self,
        _context: &mut Context,
        value: Value,
        _args: FilterArgs,
    ) -> Result<Value, EngineError> {
        match value.as_builder() {
            Some(builder) => execute_builder(builder).await,
            None => Ok(value.get_attr(&Value::from("value"))),
        }
    }
}

type Apply = fn(Value, &FilterArgs) -> Result<Value, EngineError>;

/// A synchronous filter that only looks at its value and arguments.
pub struct StandardFilter {
    name: &'static str,
    apply: Apply,
}

impl StandardFilter {
    #[must_use]
    pub fn all() -> Vec<Self> {
        let filters: [(&'static str, Apply); 16] = [
            (RAW_FILTER_NAME, |value, _| Ok(value)),
            ("void", |_, _| Ok(Value::Undefined)),
            ("unique", unique),
            ("typeof", |value, _| Ok(Value::from(value.type_name()))),
            ("upper", |value, _| Ok(Value::String(value.render().to_uppercase()))),
            ("lower", |value, _| Ok(Value::String(value.render().to_lowercase()))),
            ("trim", |value, _| Ok(Value::String(value.render().trim().to_string()))),
            ("length", length),
            ("int", int),
            ("float", float),
            ("abs", abs),
            ("default", default),
            ("join", join),
            ("first", |value, _| Ok(first_or_last(value, true))),
            ("last", |value, _| Ok(first_or_last(value, false))),
            ("replace", replace),
        ];
        filters
            .into_iter()
            .map(|(name, apply)| Self { name, apply })
            .collect()
    }
}

impl FilterBuilder for StandardFilter {
    fn filter_name(&self) -> &str {
        self.name
    }
}

#[async_trait]
impl FilterRunner for StandardFilter {
    fn filter_name(&self) -> &str {
        self.name
    }

    async fn transform(
        &self,
        _context: &mut Context,
        value: Value,
        args: FilterArgs,
    ) -> Result<Value, EngineError> {
        (self.apply)(value, &args)
    }
}

fn unique(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    let Value::Array(items) = value else {
        return Ok(value);
    };
    let by = args.get(0, "by").map(Value::render);
    let key = |item: &Value| match &by {
        Some(by) => item.get_attr(&Value::String(by.clone())),
        None => item.clone(),
    };

    let mut seen: Vec<Value> = Vec::new();
    let mut unique = Vec::new();
    for item in items {
        let item_key = key(&item);
        if !seen.iter().any(|existing| existing.loose_eq(&item_key)) {
            seen.push(item_key);
            unique.push(item);
        }
    }
    Ok(Value::Array(unique))
}

fn length(value: Value, _args: &FilterArgs) -> Result<Value, EngineError> {
    let len = match &value {
        Value::Array(items) => items.len(),
        Value::Object(entries) => entries.len(),
        Value::String(text) => text.chars().count(),
        _ => 0,
    };
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

#[allow(clippy::cast_possible_truncation)]
fn int(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    match value.as_f64() {
        Some(number) if number.is_finite() => Ok(Value::Int(number.trunc() as i64)),
        _ => Ok(args.get(0, "default").cloned().unwrap_or(Value::Int(0))),
    }
}

fn float(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    match value.as_f64() {
        Some(number) if !number.is_nan() => Ok(Value::Float(number)),
        _ => Ok(args.get(0, "default").cloned().unwrap_or(Value::Float(0.0))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn abs(value: Value, _args: &FilterArgs) -> Result<Value, EngineError> {
    Ok(match value {
        Value::Int(number) => number.checked_abs().map_or(Value::Float((number as f64).abs()), Value::Int),
        other => Value::number(other.as_f64().unwrap_or(f64::NAN).abs()),
    })
}

fn default(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    let fallback = args.get(0, "value").cloned().unwrap_or_default();
    let falsy_too = args.get(1, "boolean").is_some_and(Value::is_truthy);
    if value.is_undefined() || (falsy_too && !value.is_truthy()) {
        Ok(fallback)
    } else {
        Ok(value)
    }
}

fn join(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    let separator = args.get(0, "separator").map(Value::render).unwrap_or_default();
    let attribute = args.get(1, "attribute").map(Value::render);
    let Value::Array(items) = value else {
        return Ok(Value::String(value.render()));
    };
    Ok(Value::String(
        items
            .iter()
            .map(|item| match &attribute {
                Some(attribute) => item.get_attr(&Value::String(attribute.clone())).render(),
                None => item.render(),
            })
            .join(&separator),
    ))
}

fn first_or_last(value: Value, first: bool) -> Value {
    match value {
        Value::Array(items) => {
            let item = if first { items.into_iter().next() } else { items.into_iter().last() };
            item.unwrap_or_default()
        }
        Value::String(text) => {
            let c = if first { text.chars().next() } else { text.chars().last() };
            c.map_or(Value::Undefined, |c| Value::String(c.to_string()))
        }
        _ => Value::Undefined,
    }
}

fn replace(value: Value, args: &FilterArgs) -> Result<Value, EngineError> {
    let (Some(from), Some(to)) = (args.get(0, "old"), args.get(1, "new")) else {
        return Err(EngineError::internal("replace expects the text to find and its replacement"));
    };
    Ok(Value::String(value.render().replace(&from.render(), &to.render())))
}
