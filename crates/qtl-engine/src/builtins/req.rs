use std::sync::Arc;

use async_trait::async_trait;
use qtl_query::Parameterizer;
use qtl_query::QueryExecutor;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use qtl_templates::TokenKind;

use super::CACHE_MAIN_BUILDER_NAME;
use super::FINAL_BUILDER_NAME;
use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::ContentBlocks;
use crate::extensions::TagBuilder;
use crate::extensions::TagRunner;
use crate::passes::MainBuilderVisitor;
use crate::value::Value;

/// `{% req name [main] %} … {% endreq %}`
pub struct ReqTagBuilder;

impl TagBuilder for ReqTagBuilder {
    fn tags(&self) -> &[&'static str] {
        &["req"]
    }

    fn parse(&self, _tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        let loc = parser.next_token().loc;

        let token = parser.next_token();
        let name = match token.kind {
            TokenKind::Symbol(name) => name,
            TokenKind::BlockEnd => return Err(ParseError::syntax("Expected a variable", token.loc)),
            other => {
                return Err(ParseError::syntax(
                    format!("Expected a symbol, but got {}", other.describe()),
                    token.loc,
                ))
            }
        };

        let token = parser.next_token();
        let is_main = match &token.kind {
            TokenKind::Symbol(word) if word == "main" => {
                let end = parser.next_token();
                if end.kind != TokenKind::BlockEnd {
                    return Err(ParseError::syntax(
                        format!("Expected a block end, but got {}", end.kind.describe()),
                        end.loc,
                    ));
                }
                true
            }
            TokenKind::Symbol(_) => {
                return Err(ParseError::syntax("Expected a symbol \"main\"", token.loc))
            }
            TokenKind::BlockEnd => false,
            other => {
                return Err(ParseError::syntax(
                    format!("Expected a block end, but got {}", other.describe()),
                    token.loc,
                ))
            }
        };

        let body = parser.parse_until_blocks(&["endreq"])?;
        parser.advance_after_block_end(None)?;

        Ok(Node::ExtensionCall {
            extension: self.name(),
            args: vec![Node::literal(name, loc), Node::literal(is_main, loc)],
            content: vec![Node::NodeList {
                children: body,
                loc,
            }],
            loc,
        })
    }

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        vec![Box::new(MainBuilderVisitor::new())]
    }
}

/// Renders the body of a `req` into a query builder bound to its variable.
pub struct ReqTagRunner {
    executor: Arc<QueryExecutor>,
}

impl ReqTagRunner {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TagRunner for ReqTagRunner {
    fn tags(&self) -> &[&'static str] {
        &["req"]
    }

    async fn run(
        &self,
        context: &mut Context,
        args: Vec<Value>,
        content: ContentBlocks<'_>,
    ) -> Result<Option<String>, EngineError> {
        let name = builder_name(&args)?;
        let is_main = args.get(1).is_some_and(Value::is_truthy);
        let profile_name = context
            .metadata()
            .profile_name
            .clone()
            .ok_or_else(|| EngineError::internal("No profile name found"))?;

        let parameterizer = Arc::new(self.executor.parameterizer(&profile_name)?);
        let statement = render_statement(context, &content, Arc::clone(&parameterizer)).await?;
        let headers = context.metadata().headers.clone();

        let builder = match context.lookup(CACHE_MAIN_BUILDER_NAME).and_then(Value::as_builder) {
            Some(cached) => {
                cached.set_headers(headers);
                Arc::clone(cached)
            }
            None => self
                .executor
                .create_builder(&profile_name, statement, parameterizer, headers)?,
        };
        tracing::debug!(%name, %profile_name, is_main, "created query builder");

        context.set_variable(name, Value::Builder(Arc::clone(&builder)));
        if is_main {
            context.set_variable(FINAL_BUILDER_NAME, Value::Builder(Arc::clone(&builder)));
            context.export(FINAL_BUILDER_NAME, Value::Builder(builder));
        }
        Ok(None)
    }
}

pub(super) fn builder_name(args: &[Value]) -> Result<String, EngineError> {
    args.first()
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| EngineError::internal("The builder name is missing"))
}

/// Renders the tag body with `parameterizer` installed and cleans the
/// result. The caller's parameterizer is restored even when rendering fails.
pub(super) async fn render_statement(
    context: &mut Context,
    content: &ContentBlocks<'_>,
    parameterizer: Arc<Parameterizer>,
) -> Result<String, EngineError> {
    let parent = context.replace_parameterizer(Some(parameterizer));
    let rendered = content.render_all(context).await;
    context.replace_parameterizer(parent);
    Ok(clean_statement(&rendered?))
}

/// Drops blank lines, then `--` line comments and `/* */` block comments.
pub(super) fn clean_statement(statement: &str) -> String {
    let joined = statement
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    strip_comments(&joined)
}

fn strip_comments(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(['-', '/']) {
        let (head, tail) = rest.split_at(start);
        output.push_str(head);

        if tail.starts_with("--") {
            rest = match tail.find('\n') {
                Some(end) => &tail[end + 1..],
                None => "",
            };
        } else if tail.starts_with("/*") {
            match tail[2..].find("*/") {
                Some(end) => rest = &tail[end + 4..],
                None => {
                    output.push('/');
                    rest = &tail[1..];
                }
            }
        } else {
            output.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::TagExtensions;

    use super::*;

    struct ReqOnly;

    impl TagExtensions for ReqOnly {
        fn is_extension_tag(&self, name: &str) -> bool {
            name == "req"
        }

        fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
            ReqTagBuilder.parse(name, parser)
        }
    }

    fn parse_error(source: &str) -> String {
        match parse_template(source, &ReqOnly).unwrap_err() {
            ParseError::Syntax { message, .. } => message,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parses_name_and_main_flag() {
        let root = parse_template("{% req user main %}select 1{% endreq %}", &ReqOnly).unwrap();
        let Node::Root { children, .. } = root else {
            panic!("expected root");
        };
        let Node::ExtensionCall {
            extension,
            args,
            content,
            ..
        } = &children[0]
        else {
            panic!("expected extension call");
        };
        assert_eq!(extension, "req");
        assert_eq!(args[0].as_str_literal(), Some("user"));
        assert_eq!(args[1].as_literal(), Some(&serde_json::Value::Bool(true)));
        assert_eq!(content.len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_error("{% req %}{% endreq %}"), "Expected a variable");
        assert_eq!(
            parse_error("{% req 'user' %}{% endreq %}"),
            "Expected a symbol, but got string"
        );
        assert_eq!(
            parse_error("{% req user primary %}{% endreq %}"),
            "Expected a symbol \"main\""
        );
        assert_eq!(
            parse_error("{% req user main extra %}{% endreq %}"),
            "Expected a block end, but got symbol"
        );
        assert_eq!(
            parse_error("{% req user 1 %}{% endreq %}"),
            "Expected a block end, but got integer"
        );
    }

    #[test]
    fn test_clean_statement_drops_blank_lines_and_comments() {
        let statement = "select *\n\n  \nfrom users -- all of them\nwhere /* active */ id = $1\n";
        assert_eq!(clean_statement(statement), "select *\nfrom users where  id = $1");
    }

    #[test]
    fn test_clean_statement_keeps_unclosed_block_comment() {
        assert_eq!(clean_statement("select 1 /* open"), "select 1 /* open");
        assert_eq!(clean_statement("select 5 - 3 / 1"), "select 5 - 3 / 1");
    }
}
