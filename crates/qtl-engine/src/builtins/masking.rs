use async_trait::async_trait;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use qtl_templates::TokenKind;

use super::SANITIZER_FILTER_NAME;
use crate::context::Context;
use crate::error::EngineError;
use crate::extensions::ContentBlocks;
use crate::extensions::TagBuilder;
use crate::extensions::TagRunner;
use crate::value::Value;

/// `{% masking column partial(prefix, padding, suffix) %}`
///
/// Emits a `CASE` expression keeping the first `prefix` and last `suffix`
/// characters of `column` and replacing the rest with `padding`.
pub struct MaskingTagBuilder;

impl TagBuilder for MaskingTagBuilder {
    fn tags(&self) -> &[&'static str] {
        &["masking"]
    }

    fn parse(&self, _tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        let loc = parser.next_token().loc;

        let column = parser.next_token();
        let column_name = match column.kind {
            TokenKind::Symbol(name) | TokenKind::Str(name) => name,
            other => {
                return Err(ParseError::syntax(
                    format!("Expected a symbol, but got {}", other.describe()),
                    column.loc,
                ))
            }
        };

        let function = parser.next_token();
        match &function.kind {
            TokenKind::BlockEnd => {
                return Err(ParseError::syntax(
                    "Expected a symbol, but got a block end",
                    function.loc,
                ))
            }
            TokenKind::Symbol(name) if name == "partial" => {}
            TokenKind::Symbol(name) => {
                return Err(ParseError::syntax(format!("Unknown function: {name}"), function.loc))
            }
            other => {
                return Err(ParseError::syntax(
                    format!("Unknown function: {}", other.describe()),
                    function.loc,
                ))
            }
        }

        let (prefix, padding, suffix) = parse_partial(parser)?;
        let sanitized = |node: &Node| Node::filter(SANITIZER_FILTER_NAME, node.clone(), node.loc());

        Ok(Node::ExtensionCall {
            extension: self.name(),
            args: vec![
                Node::literal(column_name, column.loc),
                sanitized(&prefix),
                prefix,
                sanitized(&padding),
                sanitized(&suffix),
                suffix,
            ],
            content: Vec::new(),
            loc,
        })
    }
}

fn parse_partial(parser: &mut Parser<'_>) -> Result<(Node, Node, Node), ParseError> {
    let open = parser.next_token();
    if open.kind != TokenKind::LeftParen {
        return Err(ParseError::syntax("Expected a function start", open.loc));
    }

    let prefix = parser.parse_expression()?;
    let first_comma = parser.next_token();
    if first_comma.kind != TokenKind::Comma {
        return Err(ParseError::syntax(
            "Expected a function has 3 arguments, but got 1",
            first_comma.loc,
        ));
    }

    let padding = parser.parse_expression()?;
    let second_comma = parser.next_token();
    if second_comma.kind != TokenKind::Comma {
        return Err(ParseError::syntax(
            "Expected a function has 3 arguments, but got 2",
            second_comma.loc,
        ));
    }

    let suffix = parser.parse_expression()?;
    let close = parser.next_token();
    if close.kind != TokenKind::RightParen {
        return Err(ParseError::syntax("Expected a function end", close.loc));
    }
    parser.advance_after_block_end(Some(")"))?;

    Ok((prefix, padding, suffix))
}

pub struct MaskingTagRunner;

#[async_trait]
impl TagRunner for MaskingTagRunner {
    fn tags(&self) -> &[&'static str] {
        &["masking"]
    }

    async fn run(
        &self,
        _context: &mut Context,
        args: Vec<Value>,
        _content: ContentBlocks<'_>,
    ) -> Result<Option<String>, EngineError> {
        let [column, prefix, prefix_value, padding, suffix, suffix_value] = args.as_slice() else {
            return Err(EngineError::internal("The parameter is invalid"));
        };
        if prefix_value.is_undefined() || suffix_value.is_undefined() {
            return Err(EngineError::internal("The parameter is invalid"));
        }
        let (Some(prefix_count), Some(suffix_count)) = (visible_count(prefix_value), visible_count(suffix_value))
        else {
            return Err(EngineError::internal("The parameter is not number type"));
        };

        let unmasked = Value::number(prefix_count + suffix_count);
        let condition = format!("(length({column}) > {unmasked})");
        let prefix_sql = format!("substr({column}, 1, {prefix})");
        let result = if suffix_count == 0.0 {
            format!("concat({prefix_sql}, {padding})")
        } else {
            let position = Value::number(suffix_count - 1.0);
            format!(
                "concat({prefix_sql}, {padding}, substr({column}, length({column}) - {position}, {suffix}))"
            )
        };

        Ok(Some(format!(
            "CASE WHEN {condition} THEN {result} ELSE {padding} END"
        )))
    }
}

fn visible_count(value: &Value) -> Option<f64> {
    match value {
        Value::Int(_) | Value::Float(_) => value.as_f64(),
        _ => None,
    }
}
