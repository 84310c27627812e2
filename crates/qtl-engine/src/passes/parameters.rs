use indexmap::IndexMap;
use qtl_templates::Location;
use qtl_templates::Node;
use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as JsonValue;

use super::MAX_LOOKUP_DEPTH;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::validators::validator_id;

#[derive(Debug, Serialize)]
struct ParameterLocation {
    line: u32,
    column: u32,
}

#[derive(Debug, Serialize)]
struct ValidatorUse {
    name: String,
    args: Map<String, JsonValue>,
}

#[derive(Debug, Default, Serialize)]
struct Parameter {
    name: String,
    locations: Vec<ParameterLocation>,
    validators: Vec<ValidatorUse>,
}

/// Records every parameter a template reads, grouped by dotted name in the
/// order first seen.
///
/// `params.user.name` records both `user.name` and `user`. Validator filters
/// with literal arguments applied directly to a top-level parameter are
/// recorded under that parameter.
pub struct ParametersVisitor {
    root: String,
    validator_filters: FxHashSet<String>,
    parameters: IndexMap<String, Parameter>,
}

impl ParametersVisitor {
    pub fn new(root: impl Into<String>, validator_filters: impl IntoIterator<Item = String>) -> Self {
        Self {
            root: root.into(),
            validator_filters: validator_filters.into_iter().collect(),
            parameters: IndexMap::new(),
        }
    }

    /// Dotted parameter name read by `node`, if it is a lookup rooted at the
    /// parameter root.
    fn parameter_name(&self, node: &Node) -> Result<Option<String>, EngineError> {
        let Node::LookupVal { target, key, .. } = node else {
            return Ok(None);
        };
        let Some(mut segments) = literal_key(key).map(|key| vec![key]) else {
            return Ok(None);
        };

        let mut current: &Node = target;
        for _ in 0..MAX_LOOKUP_DEPTH {
            match current {
                Node::LookupVal { target, key, .. } => {
                    let Some(key) = literal_key(key) else {
                        return Ok(None);
                    };
                    segments.push(key);
                    current = &**target;
                }
                Node::FunCall { callee, .. } => current = &**callee,
                Node::Symbol { name, .. } if *name == self.root => {
                    segments.reverse();
                    return Ok(Some(segments.join(".")));
                }
                _ => return Ok(None),
            }
        }
        Err(EngineError::internal("Max depth reached"))
    }

    fn record(&mut self, name: String, loc: Location) -> &mut Parameter {
        let parameter = self
            .parameters
            .entry(name.clone())
            .or_insert_with(|| Parameter {
                name,
                ..Parameter::default()
            });
        let seen = parameter
            .locations
            .iter()
            .any(|existing| existing.line == loc.line && existing.column == loc.column);
        if !seen {
            parameter.locations.push(ParameterLocation {
                line: loc.line,
                column: loc.column,
            });
        }
        parameter
    }

    fn record_validator(&mut self, node: &Node) -> Result<(), EngineError> {
        let Node::Filter {
            name, args, kwargs, ..
        } = node
        else {
            return Ok(());
        };
        if !self.validator_filters.contains(name) {
            return Ok(());
        }
        let Some(target) = args.first() else {
            return Ok(());
        };
        let Some(parameter) = self.parameter_name(target)? else {
            return Ok(());
        };
        if parameter.contains('.') || args.len() > 1 {
            return Ok(());
        }

        let mut validator_args = Map::new();
        for kwarg in kwargs {
            let Some(value) = static_value(&kwarg.value) else {
                return Ok(());
            };
            validator_args.insert(kwarg.name.clone(), value);
        }

        let validator = ValidatorUse {
            name: validator_id(name).to_string(),
            args: validator_args,
        };
        self.record(parameter, target.loc()).validators.push(validator);
        Ok(())
    }
}

impl AstVisitor for ParametersVisitor {
    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        match node {
            Node::LookupVal { .. } => {
                if let Some(name) = self.parameter_name(node)? {
                    self.record(name, node.loc());
                }
            }
            Node::Filter { .. } => self.record_validator(node)?,
            _ => {}
        }
        Ok(())
    }

    fn metadata(&self) -> Option<(&'static str, JsonValue)> {
        let parameters: Vec<_> = self.parameters.values().collect();
        Some((
            "parameters",
            serde_json::to_value(parameters).unwrap_or(JsonValue::Null),
        ))
    }
}

fn literal_key(key: &Node) -> Option<String> {
    match key.as_literal()? {
        JsonValue::String(key) => Some(key.clone()),
        JsonValue::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

fn static_value(node: &Node) -> Option<JsonValue> {
    match node {
        Node::Literal { value, .. } => Some(value.clone()),
        Node::Array { items, .. } => items
            .iter()
            .map(|item| item.as_literal().cloned())
            .collect::<Option<Vec<_>>>()
            .map(JsonValue::Array),
        _ => None,
    }
}
