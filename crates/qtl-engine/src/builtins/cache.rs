use std::sync::Arc;

use async_trait::async_trait;
use qtl_conf::CACHE_PROFILE_NAME;
use qtl_conf::CACHE_SCHEMA_NAME;
use qtl_query::QueryExecutor;
use qtl_templates::Location;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use qtl_templates::TokenKind;
use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;

use super::req::builder_name;
use super::req::render_statement;
use super::CACHE_MAIN_BUILDER_NAME;
use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::ContentBlocks;
use crate::extensions::TagBuilder;
use crate::extensions::TagRunner;
use crate::value::Value;

/// `{% cache [name] %} … {% endcache %}`
///
/// Without a name the builder replaces the main builder's query, so the
/// template result comes straight from the cache.
pub struct CacheTagBuilder;

impl TagBuilder for CacheTagBuilder {
    fn tags(&self) -> &[&'static str] {
        &["cache"]
    }

    fn parse(&self, _tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        let loc = parser.next_token().loc;

        let token = parser.next_token();
        let name = match token.kind {
            TokenKind::BlockEnd => Node::literal(CACHE_MAIN_BUILDER_NAME, loc),
            TokenKind::Symbol(name) => {
                let end = parser.next_token();
                if end.kind != TokenKind::BlockEnd {
                    return Err(ParseError::syntax(
                        format!("Expected a block end, but got {}", end.kind.describe()),
                        end.loc,
                    ));
                }
                Node::literal(name, token.loc)
            }
            other => {
                return Err(ParseError::syntax(
                    format!("Expected a symbol or a block end, but got {}", other.describe()),
                    token.loc,
                ))
            }
        };

        let body = parser.parse_until_blocks(&["endcache"])?;
        parser.advance_after_block_end(None)?;

        Ok(Node::ExtensionCall {
            extension: self.name(),
            args: vec![name],
            content: vec![Node::NodeList {
                children: body,
                loc,
            }],
            loc,
        })
    }

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        vec![Box::new(CacheVisitor::default())]
    }
}

#[derive(Default)]
struct CacheVisitor {
    declared: FxHashMap<String, Location>,
    has_main: bool,
    used: bool,
}

impl AstVisitor for CacheVisitor {
    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        let Node::ExtensionCall {
            extension, args, ..
        } = node
        else {
            return Ok(());
        };
        if extension != "cache" {
            return Ok(());
        }
        self.used = true;

        let Some(variable) = args.first() else {
            return Ok(());
        };
        let (Some(name), loc) = (variable.as_str_literal(), variable.loc()) else {
            return Ok(());
        };

        if name == CACHE_MAIN_BUILDER_NAME {
            if self.has_main {
                return Err(EngineError::syntax(
                    "Only one cache tag without variable is allowed.",
                    loc,
                ));
            }
            self.has_main = true;
        } else if let Some(previous) = self.declared.get(name) {
            return Err(EngineError::syntax(
                format!(
                    "We can't declare multiple cache tag builder with same name. Duplicated name: {name} (declared at {previous} and {loc})"
                ),
                loc,
            ));
        }
        self.declared.insert(name.to_string(), loc);
        Ok(())
    }

    fn metadata(&self) -> Option<(&'static str, JsonValue)> {
        Some(("cache", JsonValue::Bool(self.used)))
    }
}

/// Renders the body of a `cache` tag into a builder on the cache profile.
pub struct CacheTagRunner {
    executor: Arc<QueryExecutor>,
}

impl CacheTagRunner {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TagRunner for CacheTagRunner {
    fn tags(&self) -> &[&'static str] {
        &["cache"]
    }

    async fn run(
        &self,
        context: &mut Context,
        args: Vec<Value>,
        content: ContentBlocks<'_>,
    ) -> Result<Option<String>, EngineError> {
        let name = builder_name(&args)?;
        let parameterizer = Arc::new(self.executor.parameterizer(CACHE_PROFILE_NAME)?);
        let statement = render_statement(context, &content, Arc::clone(&parameterizer)).await?;
        let statement = format!("set schema={CACHE_SCHEMA_NAME};\n{statement}");

        let headers = context.metadata().headers.clone();
        let builder =
            self.executor
                .create_builder(CACHE_PROFILE_NAME, statement, parameterizer, headers)?;
        tracing::debug!(%name, "created cache query builder");

        context.set_variable(name, Value::Builder(builder));
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::TagExtensions;

    use super::*;

    struct CacheOnly;

    impl TagExtensions for CacheOnly {
        fn is_extension_tag(&self, name: &str) -> bool {
            name == "cache"
        }

        fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
            CacheTagBuilder.parse(name, parser)
        }
    }

    fn visit_all(source: &str) -> Result<CacheVisitor, EngineError> {
        let root = parse_template(source, &CacheOnly)?;
        let mut visitor = CacheVisitor::default();
        let Node::Root { mut children, .. } = root else {
            panic!("expected root");
        };
        for child in &mut children {
            visitor.on_visit(child)?;
        }
        Ok(visitor)
    }

    #[test]
    fn test_unnamed_cache_uses_main_builder_name() {
        let root = parse_template("{% cache %}select 1{% endcache %}", &CacheOnly).unwrap();
        let Node::Root { children, .. } = root else {
            panic!("expected root");
        };
        let Node::ExtensionCall { args, .. } = &children[0] else {
            panic!("expected extension call");
        };
        assert_eq!(args[0].as_str_literal(), Some(CACHE_MAIN_BUILDER_NAME));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_template("{% cache 'x' %}{% endcache %}", &CacheOnly).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Expected a symbol or a block end, but got string"));
        let err = parse_template("{% cache a b %}{% endcache %}", &CacheOnly).unwrap_err();
        assert!(err.to_string().starts_with("Expected a block end, but got symbol"));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = visit_all("{% cache a %}x{% endcache %}{% cache a %}y{% endcache %}")
            .err()
            .unwrap();
        assert!(err
            .to_string()
            .contains("Duplicated name: a (declared at 1:10 and 1:38)"));
    }

    #[test]
    fn test_only_one_unnamed_cache() {
        let err = visit_all("{% cache %}x{% endcache %}{% cache %}y{% endcache %}")
            .err()
            .unwrap();
        assert!(err
            .to_string()
            .starts_with("Only one cache tag without variable is allowed."));
    }

    #[test]
    fn test_metadata_reports_usage() {
        let visitor = visit_all("{% cache a %}x{% endcache %}").unwrap();
        assert_eq!(visitor.metadata(), Some(("cache", JsonValue::Bool(true))));
        let visitor = visit_all("select 1").unwrap();
        assert_eq!(visitor.metadata(), Some(("cache", JsonValue::Bool(false))));
    }
}
