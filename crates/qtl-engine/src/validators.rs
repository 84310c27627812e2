//! Input validators, exposed to templates as `is_<id>` filters.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::FilterArgs;
use crate::extensions::FilterBuilder;
use crate::extensions::FilterRunner;
use crate::value::Value;

const FILTER_PREFIX: &str = "is_";

/// Name of the filter that runs the validator `id`.
#[must_use]
pub fn validator_filter_name(id: &str) -> String {
    format!("{FILTER_PREFIX}{id}")
}

/// Validator id behind a validator filter name.
#[must_use]
pub fn validator_id(filter_name: &str) -> &str {
    filter_name.strip_prefix(FILTER_PREFIX).unwrap_or(filter_name)
}

pub trait Validator: Send + Sync {
    fn id(&self) -> &str;

    /// Checks the arguments a template passes to the validator.
    fn validate_schema(&self, args: &JsonValue) -> Result<(), EngineError>;

    /// Checks an input value; failures are user errors.
    fn validate_data(&self, value: &Value, args: &JsonValue) -> Result<(), EngineError>;
}

/// Validators by id, in registration order.
#[derive(Clone, Default)]
pub struct ValidatorLoader {
    validators: IndexMap<String, Arc<dyn Validator>>,
}

impl ValidatorLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader holding `required`, `integer` and `enum`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut loader = Self::new();
        for validator in [
            Arc::new(RequiredValidator) as Arc<dyn Validator>,
            Arc::new(IntegerValidator),
            Arc::new(EnumValidator),
        ] {
            loader
                .validators
                .insert(validator.id().to_string(), validator);
        }
        loader
    }

    pub fn register(&mut self, validator: Arc<dyn Validator>) -> Result<(), EngineError> {
        let id = validator.id().to_string();
        if self.validators.contains_key(&id) {
            return Err(EngineError::Configuration(format!(
                "A validator named `{id}` is already registered"
            )));
        }
        self.validators.insert(id, validator);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Validator>> {
        self.validators.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    /// One filter per validator.
    #[must_use]
    pub fn filters(&self) -> Vec<ValidatorFilter> {
        self.validators
            .values()
            .map(|validator| ValidatorFilter {
                name: validator_filter_name(validator.id()),
                validator: Arc::clone(validator),
            })
            .collect()
    }
}

/// Validates the filtered value with the filter's keyword arguments and
/// passes it through unchanged.
pub struct ValidatorFilter {
    name: String,
    validator: Arc<dyn Validator>,
}

impl FilterBuilder for ValidatorFilter {
    fn filter_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl FilterRunner for ValidatorFilter {
    fn filter_name(&self) -> &str {
        &self.name
    }

    async fn transform(
        &self,
        _context: &mut Context,
        value: Value,
        args: FilterArgs,
    ) -> Result<Value, EngineError> {
        let mut arguments = Map::new();
        for (name, arg) in args.keyword {
            let arg = arg.to_json().ok_or_else(|| {
                EngineError::internal(format!("Invalid argument `{name}` for filter {}", self.name))
            })?;
            arguments.insert(name, arg);
        }
        let arguments = JsonValue::Object(arguments);

        self.validator.validate_schema(&arguments)?;
        self.validator.validate_data(&value, &arguments)?;
        Ok(value)
    }
}

fn parse_args<T: DeserializeOwned>(id: &str, args: &JsonValue) -> Result<T, EngineError> {
    serde_json::from_value(args.clone()).map_err(|err| {
        EngineError::internal(format!(
            "The arguments schema for \"{id}\" type validator is incorrect: {err}"
        ))
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequiredArgs {
    #[serde(default)]
    disallow: Vec<JsonValue>,
}

/// Rejects `undefined`, and any value listed in `disallow`.
pub struct RequiredValidator;

impl Validator for RequiredValidator {
    fn id(&self) -> &str {
        "required"
    }

    fn validate_schema(&self, args: &JsonValue) -> Result<(), EngineError> {
        parse_args::<RequiredArgs>(self.id(), args).map(|_| ())
    }

    fn validate_data(&self, value: &Value, args: &JsonValue) -> Result<(), EngineError> {
        let args: RequiredArgs = parse_args(self.id(), args)?;
        let disallowed = value.is_undefined()
            || value
                .to_json()
                .is_some_and(|json| args.disallow.contains(&json));
        if disallowed {
            return Err(EngineError::user(
                "The input parameter is invalid, it should be required",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntegerArgs {
    min: Option<i64>,
    max: Option<i64>,
    greater: Option<i64>,
    less: Option<i64>,
}

/// Accepts integers and integral numeric strings within optional bounds.
/// `undefined` passes; pair with `required` to forbid it.
pub struct IntegerValidator;

impl Validator for IntegerValidator {
    fn id(&self) -> &str {
        "integer"
    }

    fn validate_schema(&self, args: &JsonValue) -> Result<(), EngineError> {
        parse_args::<IntegerArgs>(self.id(), args).map(|_| ())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn validate_data(&self, value: &Value, args: &JsonValue) -> Result<(), EngineError> {
        if value.is_undefined() {
            return Ok(());
        }
        let args: IntegerArgs = parse_args(self.id(), args)?;
        let invalid = || EngineError::user("The input parameter is invalid, it should be integer type");

        let number = match value {
            Value::Int(number) => *number,
            Value::Float(number) if number.fract() == 0.0 && number.is_finite() => *number as i64,
            Value::String(text) => text.trim().parse().map_err(|_| invalid())?,
            _ => return Err(invalid()),
        };

        let in_range = args.min.map_or(true, |min| number >= min)
            && args.max.map_or(true, |max| number <= max)
            && args.greater.map_or(true, |greater| number > greater)
            && args.less.map_or(true, |less| number < less);
        if in_range {
            Ok(())
        } else {
            Err(invalid())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnumArgs {
    items: Vec<JsonValue>,
}

/// Accepts only the listed `items`.
pub struct EnumValidator;

impl Validator for EnumValidator {
    fn id(&self) -> &str {
        "enum"
    }

    fn validate_schema(&self, args: &JsonValue) -> Result<(), EngineError> {
        let args: EnumArgs = parse_args(self.id(), args)?;
        if args.items.is_empty() {
            return Err(EngineError::internal(
                "The arguments schema for \"enum\" type validator is invalid: items must not be empty",
            ));
        }
        Ok(())
    }

    fn validate_data(&self, value: &Value, args: &JsonValue) -> Result<(), EngineError> {
        let args: EnumArgs = parse_args(self.id(), args)?;
        let allowed = value
            .to_json()
            .is_some_and(|json| args.items.contains(&json));
        if allowed {
            Ok(())
        } else {
            Err(EngineError::user(format!(
                "The input data for \"enum\" type validator is invalid: must be one of {}",
                JsonValue::Array(args.items)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    mod required {
        use super::*;

        #[test]
        fn test_undefined_is_rejected() {
            let err = RequiredValidator
                .validate_data(&Value::Undefined, &json!({}))
                .unwrap_err();
            assert!(matches!(err, EngineError::User { .. }));
        }

        #[test]
        fn test_disallowed_values_are_rejected() {
            let args = json!({"disallow": ["", 0]});
            assert!(RequiredValidator.validate_data(&Value::from(""), &args).is_err());
            assert!(RequiredValidator.validate_data(&Value::Int(0), &args).is_err());
            assert!(RequiredValidator.validate_data(&Value::from("x"), &args).is_ok());
        }
    }

    mod integer {
        use super::*;

        #[test]
        fn test_bounds() {
            let args = json!({"min": 1, "less": 10});
            assert!(IntegerValidator.validate_data(&Value::Int(1), &args).is_ok());
            assert!(IntegerValidator.validate_data(&Value::from("9"), &args).is_ok());
            assert!(IntegerValidator.validate_data(&Value::Int(10), &args).is_err());
            assert!(IntegerValidator.validate_data(&Value::Int(0), &args).is_err());
            assert!(IntegerValidator.validate_data(&Value::Float(1.5), &args).is_err());
        }

        #[test]
        fn test_unknown_argument_is_schema_error() {
            let err = IntegerValidator.validate_schema(&json!({"maximum": 3})).unwrap_err();
            assert!(matches!(err, EngineError::Internal(_)));
        }
    }

    mod enumeration {
        use super::*;

        #[test]
        fn test_only_listed_items_pass() {
            let args = json!({"items": ["a", 1]});
            assert!(EnumValidator.validate_data(&Value::from("a"), &args).is_ok());
            assert!(EnumValidator.validate_data(&Value::Int(1), &args).is_ok());
            assert!(EnumValidator.validate_data(&Value::from("b"), &args).is_err());
        }

        #[test]
        fn test_empty_items_is_schema_error() {
            assert!(EnumValidator.validate_schema(&json!({"items": []})).is_err());
        }
    }

    #[test]
    fn test_loader_exposes_prefixed_filters() {
        let loader = ValidatorLoader::with_builtins();
        let names: Vec<_> = loader
            .filters()
            .iter()
            .map(|filter| FilterBuilder::filter_name(filter).to_string())
            .collect();
        assert_eq!(names, vec!["is_required", "is_integer", "is_enum"]);
        assert_eq!(validator_id("is_integer"), "integer");
    }

    #[test]
    fn test_duplicate_validator_is_rejected() {
        let mut loader = ValidatorLoader::with_builtins();
        assert!(loader.register(Arc::new(EnumValidator)).is_err());
    }
}
