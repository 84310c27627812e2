use async_trait::async_trait;
use indexmap::IndexMap;
use qtl_templates::Location;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use serde_json::json;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::ContentBlocks;
use crate::extensions::TagBuilder;
use crate::extensions::TagRunner;
use crate::value::Value;

/// `{% error "CODE" %}` aborts the render with a user error.
///
/// The tag's own line and column are appended as two trailing literal
/// arguments so the runner can report where the error was thrown.
pub struct ErrorTagBuilder;

impl TagBuilder for ErrorTagBuilder {
    fn tags(&self) -> &[&'static str] {
        &["error"]
    }

    fn parse(&self, tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        let loc = parser.next_token().loc;
        let (mut args, _) = parser.parse_signature()?;
        parser.advance_after_block_end(Some(tag))?;

        args.push(Node::literal(loc.line, loc));
        args.push(Node::literal(loc.column, loc));

        Ok(Node::ExtensionCall {
            extension: self.name(),
            args,
            content: Vec::new(),
            loc,
        })
    }

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        vec![Box::new(ErrorCodesVisitor::default())]
    }
}

#[derive(Default)]
struct ErrorCodesVisitor {
    codes: IndexMap<String, Vec<Location>>,
}

impl AstVisitor for ErrorCodesVisitor {
    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        let Node::ExtensionCall {
            extension,
            args,
            loc,
            ..
        } = node
        else {
            return Ok(());
        };
        if extension != "error" {
            return Ok(());
        }

        let code = match args.first() {
            Some(Node::Literal { value, loc }) => {
                let code = match value {
                    JsonValue::String(code) => code.clone(),
                    other => other.to_string(),
                };
                (code, *loc)
            }
            Some(other) => {
                return Err(EngineError::syntax(
                    format!("Expected literal, got {}", other.kind()),
                    other.loc(),
                ))
            }
            None => return Err(EngineError::syntax("Expected literal, got nothing", *loc)),
        };
        self.codes.entry(code.0).or_default().push(code.1);
        Ok(())
    }

    fn metadata(&self) -> Option<(&'static str, JsonValue)> {
        let errors = self
            .codes
            .iter()
            .map(|(code, locations)| {
                json!({
                    "code": code,
                    "locations": locations
                        .iter()
                        .map(|loc| json!({"line": loc.line, "column": loc.column}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        Some(("errors", JsonValue::Array(errors)))
    }
}

pub struct ErrorTagRunner;

#[async_trait]
impl TagRunner for ErrorTagRunner {
    fn tags(&self) -> &[&'static str] {
        &["error"]
    }

    async fn run(
        &self,
        _context: &mut Context,
        args: Vec<Value>,
        _content: ContentBlocks<'_>,
    ) -> Result<Option<String>, EngineError> {
        let position = |value: Option<&Value>| {
            value
                .and_then(|value| match value {
                    Value::Int(number) => u32::try_from(*number).ok(),
                    _ => None,
                })
                .unwrap_or_default()
        };
        let count = args.len();
        let line = position(count.checked_sub(2).and_then(|index| args.get(index)));
        let column = position(count.checked_sub(1).and_then(|index| args.get(index)));
        let message = args.first().map(Value::render).unwrap_or_default();

        Err(EngineError::User {
            description: Some(format!(
                "Error thrown when rendering the template at line {line}, column {column}"
            )),
            location: Some(Location::new(line, column)),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::TagExtensions;

    use super::*;

    struct ErrorOnly;

    impl TagExtensions for ErrorOnly {
        fn is_extension_tag(&self, name: &str) -> bool {
            name == "error"
        }

        fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
            ErrorTagBuilder.parse(name, parser)
        }
    }

    fn visit(source: &str) -> Result<ErrorCodesVisitor, EngineError> {
        let Node::Root { mut children, .. } = parse_template(source, &ErrorOnly)? else {
            panic!("expected root");
        };
        let mut visitor = ErrorCodesVisitor::default();
        for child in &mut children {
            visitor.on_visit(child)?;
        }
        Ok(visitor)
    }

    #[test]
    fn test_location_literals_are_appended() {
        let Node::Root { children, .. } = parse_template("\n  {% error 'E1' %}", &ErrorOnly).unwrap()
        else {
            panic!("expected root");
        };
        let Node::ExtensionCall { args, .. } = &children[1] else {
            panic!("expected extension call");
        };
        assert_eq!(args.len(), 3);
        assert_eq!(args[1].as_literal(), Some(&json!(2)));
        assert_eq!(args[2].as_literal(), Some(&json!(6)));
    }

    #[test]
    fn test_codes_are_grouped() {
        let visitor = visit("{% error 'A' %}{% error 'B' %}\n{% error 'A' %}").unwrap();
        assert_eq!(
            visitor.metadata().unwrap().1,
            json!([
                {"code": "A", "locations": [{"line": 1, "column": 10}, {"line": 2, "column": 10}]},
                {"code": "B", "locations": [{"line": 1, "column": 25}]},
            ])
        );
    }

    #[test]
    fn test_non_literal_code_is_rejected() {
        let err = visit("{% error code %}").err().unwrap();
        assert!(err.to_string().starts_with("Expected literal, got Symbol"));
    }
}
