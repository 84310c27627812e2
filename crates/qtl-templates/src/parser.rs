use serde::Serialize;
use thiserror::Error;

use crate::nodes::BinaryOperator;
use crate::nodes::KeywordArg;
use crate::nodes::Node;
use crate::nodes::UnaryOperator;
use crate::tokens::Location;
use crate::tokens::Token;
use crate::tokens::TokenKind;

/// Maximum nesting of statements and expressions before parsing gives up.
pub const MAX_NESTING: usize = 64;

/// Tags that the parser delegates to registered extensions.
pub trait TagExtensions {
    fn is_extension_tag(&self, name: &str) -> bool;

    /// Parses the tag whose name is the next token. The parser is positioned
    /// right after the opening `{%`.
    fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError>;
}

/// Parser without any extension tags.
pub struct NoExtensions;

impl TagExtensions for NoExtensions {
    fn is_extension_tag(&self, _name: &str) -> bool {
        false
    }

    fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        Err(ParseError::UnknownTag {
            name: name.to_string(),
            loc: parser.peek_token().loc,
        })
    }
}

pub struct Parser<'e> {
    tokens: Vec<Token>,
    current: usize,
    extensions: &'e dyn TagExtensions,
    open_tags: Vec<(String, Location)>,
    depth: usize,
}

impl<'e> Parser<'e> {
    #[must_use]
    pub fn new(tokens: Vec<Token>, extensions: &'e dyn TagExtensions) -> Self {
        Self {
            tokens,
            current: 0,
            extensions,
            open_tags: Vec::new(),
            depth: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Node, ParseError> {
        let children = self.parse_nodes(&[])?;
        Ok(Node::Root {
            children,
            loc: Location::new(1, 1),
        })
    }

    /// Parses template content until one of `names` opens a block. The
    /// parser is left on the block's name token.
    pub fn parse_until_blocks(&mut self, names: &[&str]) -> Result<Vec<Node>, ParseError> {
        self.parse_nodes(names)
    }

    /// Consumes the optional block name and the closing `%}`.
    pub fn advance_after_block_end(&mut self, name: Option<&str>) -> Result<(), ParseError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let token = self.next_token();
                let TokenKind::Symbol(name) = token.kind else {
                    return Err(ParseError::syntax(
                        "advance_after_block_end: expected symbol token or explicit name",
                        token.loc,
                    ));
                };
                name
            }
        };

        let token = self.next_token();
        if token.kind == TokenKind::BlockEnd {
            Ok(())
        } else {
            Err(ParseError::syntax(
                format!("expected block end in {name} statement"),
                token.loc,
            ))
        }
    }

    /// Parses comma separated arguments up to, but not including, the block end.
    pub fn parse_signature(&mut self) -> Result<(Vec<Node>, Vec<KeywordArg>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        while self.peek_token().kind != TokenKind::BlockEnd {
            if !args.is_empty() || !kwargs.is_empty() {
                self.expect(&TokenKind::Comma, "comma")?;
            }
            self.parse_argument(&mut args, &mut kwargs)?;
        }

        Ok((args, kwargs))
    }

    pub fn parse_expression(&mut self) -> Result<Node, ParseError> {
        self.enter()?;
        let result = self.parse_inline_if();
        self.leave();
        result
    }

    #[must_use]
    pub fn peek_token(&self) -> &Token {
        self.peek_at(0)
    }

    #[must_use]
    pub fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.current + offset).min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    /// Consumes and returns the next token. The end-of-file token is never
    /// consumed.
    pub fn next_token(&mut self) -> Token {
        let token = self.peek_token().clone();
        if token.kind != TokenKind::Eof {
            self.current += 1;
        }
        token
    }

    pub fn skip_symbol(&mut self, name: &str) -> bool {
        if self.peek_token().is_symbol(name) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn parse_nodes(&mut self, end_tags: &[&str]) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();

        loop {
            let token = self.peek_token().clone();
            match token.kind {
                TokenKind::Eof => {
                    if end_tags.is_empty() {
                        return Ok(nodes);
                    }
                    return Err(self.unclosed(end_tags, token.loc));
                }
                TokenKind::Data(value) => {
                    self.current += 1;
                    nodes.push(Node::Output {
                        children: vec![Node::TemplateData {
                            value,
                            loc: token.loc,
                        }],
                        loc: token.loc,
                    });
                }
                TokenKind::VariableStart => {
                    self.current += 1;
                    let expr = self.parse_expression()?;
                    self.expect(&TokenKind::VariableEnd, "a variable end")?;
                    nodes.push(Node::Output {
                        children: vec![expr],
                        loc: token.loc,
                    });
                }
                TokenKind::BlockStart => {
                    self.current += 1;
                    if let TokenKind::Symbol(name) = &self.peek_token().kind {
                        if end_tags.contains(&name.as_str()) {
                            return Ok(nodes);
                        }
                    }
                    nodes.push(self.parse_statement()?);
                }
                _ => {
                    return Err(ParseError::syntax(
                        format!("Unexpected token: {}", token.kind.describe()),
                        token.loc,
                    ))
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Node, ParseError> {
        let token = self.peek_token().clone();
        let TokenKind::Symbol(name) = &token.kind else {
            return Err(ParseError::syntax("tag name expected", token.loc));
        };

        self.enter()?;
        self.open_tags.push((name.clone(), token.loc));
        let result = match name.as_str() {
            "if" => self.parse_if(),
            "for" => self.parse_for(),
            "set" => self.parse_set(),
            _ if self.extensions.is_extension_tag(name) => {
                let extensions = self.extensions;
                extensions.parse_extension(name, self)
            }
            _ => Err(ParseError::UnknownTag {
                name: name.clone(),
                loc: token.loc,
            }),
        };
        self.open_tags.pop();
        self.leave();
        result
    }

    fn parse_if(&mut self) -> Result<Node, ParseError> {
        let loc = self.next_token().loc;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::BlockEnd, "a block end")?;
        let body = self.parse_until_blocks(&["elif", "elseif", "else", "endif"])?;

        let else_body = if self.peek_token().is_symbol("elif") || self.peek_token().is_symbol("elseif")
        {
            vec![self.parse_if()?]
        } else if self.skip_symbol("else") {
            self.expect(&TokenKind::BlockEnd, "a block end")?;
            let else_body = self.parse_until_blocks(&["endif"])?;
            self.advance_after_block_end(None)?;
            else_body
        } else {
            self.advance_after_block_end(None)?;
            Vec::new()
        };

        Ok(Node::If {
            cond: Box::new(cond),
            body,
            else_body,
            loc,
        })
    }

    fn parse_for(&mut self) -> Result<Node, ParseError> {
        let loc = self.next_token().loc;

        let mut targets = vec![self.expect_symbol("loop variable")?];
        while self.peek_token().kind == TokenKind::Comma {
            self.current += 1;
            targets.push(self.expect_symbol("loop variable")?);
        }

        if !self.skip_symbol("in") {
            return Err(ParseError::syntax(
                "expected \"in\" keyword for loop",
                self.peek_token().loc,
            ));
        }

        let iter = self.parse_expression()?;
        self.expect(&TokenKind::BlockEnd, "a block end")?;
        let body = self.parse_until_blocks(&["else", "endfor"])?;

        let else_body = if self.skip_symbol("else") {
            self.expect(&TokenKind::BlockEnd, "a block end")?;
            let else_body = self.parse_until_blocks(&["endfor"])?;
            self.advance_after_block_end(None)?;
            else_body
        } else {
            self.advance_after_block_end(None)?;
            Vec::new()
        };

        Ok(Node::For {
            targets,
            iter: Box::new(iter),
            body,
            else_body,
            loc,
        })
    }

    fn parse_set(&mut self) -> Result<Node, ParseError> {
        let loc = self.next_token().loc;

        let mut targets = vec![self.expect_symbol("variable name")?];
        while self.peek_token().kind == TokenKind::Comma {
            self.current += 1;
            targets.push(self.expect_symbol("variable name")?);
        }

        let token = self.next_token();
        let value = match token.kind {
            TokenKind::Operator("=") => {
                let value = self.parse_expression()?;
                self.expect(&TokenKind::BlockEnd, "a block end")?;
                value
            }
            TokenKind::BlockEnd => {
                let body = self.parse_until_blocks(&["endset"])?;
                self.advance_after_block_end(None)?;
                Node::Capture {
                    body,
                    loc: token.loc,
                }
            }
            other => {
                return Err(ParseError::syntax(
                    format!("expected = or block end in set tag, but got {}", other.describe()),
                    token.loc,
                ))
            }
        };

        Ok(Node::Set {
            targets,
            value: Box::new(value),
            loc,
        })
    }

    fn parse_inline_if(&mut self) -> Result<Node, ParseError> {
        let body = self.parse_or()?;
        if !self.skip_symbol("if") {
            return Ok(body);
        }

        let cond = self.parse_or()?;
        let else_body = if self.skip_symbol("else") {
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };

        let loc = body.loc();
        Ok(Node::InlineIf {
            cond: Box::new(cond),
            body: Box::new(body),
            else_body,
            loc,
        })
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_and()?;
        while self.skip_symbol("or") {
            let right = self.parse_and()?;
            node = binary(BinaryOperator::Or, node, right);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_not()?;
        while self.skip_symbol("and") {
            let right = self.parse_not()?;
            node = binary(BinaryOperator::And, node, right);
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<Node, ParseError> {
        let loc = self.peek_token().loc;
        if self.skip_symbol("not") {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Node::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand?),
                loc,
            });
        }
        self.parse_in()
    }

    fn parse_in(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_compare()?;
        loop {
            let op = if self.peek_token().is_symbol("not") && self.peek_at(1).is_symbol("in") {
                self.current += 2;
                BinaryOperator::NotIn
            } else if self.skip_symbol("in") {
                BinaryOperator::In
            } else {
                return Ok(node);
            };
            let right = self.parse_compare()?;
            node = binary(op, node, right);
        }
    }

    fn parse_compare(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_concat()?;
        loop {
            let op = match &self.peek_token().kind {
                TokenKind::Operator("==") => BinaryOperator::Eq,
                TokenKind::Operator("!=") => BinaryOperator::Ne,
                TokenKind::Operator("<") => BinaryOperator::Lt,
                TokenKind::Operator("<=") => BinaryOperator::Le,
                TokenKind::Operator(">") => BinaryOperator::Gt,
                TokenKind::Operator(">=") => BinaryOperator::Ge,
                _ => return Ok(node),
            };
            self.current += 1;
            let right = self.parse_concat()?;
            node = binary(op, node, right);
        }
    }

    fn parse_concat(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_add()?;
        while self.peek_token().is_operator("~") {
            self.current += 1;
            let right = self.parse_add()?;
            node = binary(BinaryOperator::Concat, node, right);
        }
        Ok(node)
    }

    fn parse_add(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_mul()?;
        loop {
            let op = match &self.peek_token().kind {
                TokenKind::Operator("+") => BinaryOperator::Add,
                TokenKind::Operator("-") => BinaryOperator::Sub,
                _ => return Ok(node),
            };
            self.current += 1;
            let right = self.parse_mul()?;
            node = binary(op, node, right);
        }
    }

    fn parse_mul(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_pow()?;
        loop {
            let op = match &self.peek_token().kind {
                TokenKind::Operator("*") => BinaryOperator::Mul,
                TokenKind::Operator("/") => BinaryOperator::Div,
                TokenKind::Operator("//") => BinaryOperator::FloorDiv,
                TokenKind::Operator("%") => BinaryOperator::Mod,
                _ => return Ok(node),
            };
            self.current += 1;
            let right = self.parse_pow()?;
            node = binary(op, node, right);
        }
    }

    fn parse_pow(&mut self) -> Result<Node, ParseError> {
        let mut node = self.parse_unary(false)?;
        while self.peek_token().is_operator("**") {
            self.current += 1;
            let right = self.parse_unary(false)?;
            node = binary(BinaryOperator::Pow, node, right);
        }
        Ok(node)
    }

    fn parse_unary(&mut self, no_filters: bool) -> Result<Node, ParseError> {
        let token = self.peek_token().clone();
        let op = match token.kind {
            TokenKind::Operator("-") => Some(UnaryOperator::Neg),
            TokenKind::Operator("+") => Some(UnaryOperator::Pos),
            _ => None,
        };

        let node = if let Some(op) = op {
            self.current += 1;
            self.enter()?;
            let operand = self.parse_unary(true);
            self.leave();
            Node::UnaryOp {
                op,
                operand: Box::new(operand?),
                loc: token.loc,
            }
        } else {
            self.parse_primary()?
        };

        if no_filters {
            Ok(node)
        } else {
            self.parse_filter(node)
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let token = self.next_token();
        let loc = token.loc;

        let node = match token.kind {
            TokenKind::Str(value) => Node::literal(value, loc),
            TokenKind::Int(value) => Node::literal(value, loc),
            TokenKind::Float(value) => Node::literal(value, loc),
            TokenKind::Symbol(name) => match name.as_str() {
                "true" | "True" => Node::literal(true, loc),
                "false" | "False" => Node::literal(false, loc),
                "none" | "None" | "null" => Node::literal(serde_json::Value::Null, loc),
                _ => Node::Symbol { name, loc },
            },
            TokenKind::LeftParen => {
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "a function end")?;
                expr
            }
            TokenKind::LeftBracket => {
                let items = self.parse_sequence(&TokenKind::RightBracket)?;
                Node::Array { items, loc }
            }
            TokenKind::LeftCurly => self.parse_dict(loc)?,
            other => {
                return Err(ParseError::syntax(
                    format!("Unexpected token: {}", other.describe()),
                    loc,
                ))
            }
        };

        self.parse_postfix(node)
    }

    fn parse_postfix(&mut self, mut node: Node) -> Result<Node, ParseError> {
        loop {
            match self.peek_token().kind {
                TokenKind::LeftParen => {
                    self.current += 1;
                    let (args, kwargs) = self.parse_call_args()?;
                    let loc = node.loc();
                    node = Node::FunCall {
                        callee: Box::new(node),
                        args,
                        kwargs,
                        loc,
                    };
                }
                TokenKind::LeftBracket => {
                    self.current += 1;
                    let key = self.parse_expression()?;
                    self.expect(&TokenKind::RightBracket, "right bracket")?;
                    let loc = node.loc();
                    node = Node::LookupVal {
                        target: Box::new(node),
                        key: Box::new(key),
                        loc,
                    };
                }
                TokenKind::Dot => {
                    self.current += 1;
                    let token = self.next_token();
                    let key = match token.kind {
                        TokenKind::Symbol(name) => Node::literal(name, token.loc),
                        TokenKind::Int(index) => Node::literal(index, token.loc),
                        other => {
                            return Err(ParseError::syntax(
                                format!(
                                    "expected name as lookup value, got {}",
                                    other.describe()
                                ),
                                token.loc,
                            ))
                        }
                    };
                    let loc = node.loc();
                    node = Node::LookupVal {
                        target: Box::new(node),
                        key: Box::new(key),
                        loc,
                    };
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_filter(&mut self, mut node: Node) -> Result<Node, ParseError> {
        while self.peek_token().kind == TokenKind::Pipe {
            self.current += 1;
            let token = self.next_token();
            let TokenKind::Symbol(name) = token.kind else {
                return Err(ParseError::syntax(
                    format!("expected filter name, got {}", token.kind.describe()),
                    token.loc,
                ));
            };

            let mut args = vec![node];
            let mut kwargs = Vec::new();
            if self.peek_token().kind == TokenKind::LeftParen {
                self.current += 1;
                let (extra_args, extra_kwargs) = self.parse_call_args()?;
                args.extend(extra_args);
                kwargs = extra_kwargs;
            }

            node = Node::Filter {
                name,
                args,
                kwargs,
                loc: token.loc,
            };
        }
        Ok(node)
    }

    fn parse_dict(&mut self, loc: Location) -> Result<Node, ParseError> {
        let mut pairs = Vec::new();
        loop {
            if self.peek_token().kind == TokenKind::RightCurly {
                self.current += 1;
                return Ok(Node::Dict { pairs, loc });
            }
            if !pairs.is_empty() {
                self.expect(&TokenKind::Comma, "comma")?;
                if self.peek_token().kind == TokenKind::RightCurly {
                    continue;
                }
            }

            let key = match self.peek_token().kind.clone() {
                TokenKind::Symbol(name) => {
                    let token = self.next_token();
                    Node::literal(name, token.loc)
                }
                _ => self.parse_expression()?,
            };
            self.expect(&TokenKind::Colon, "colon")?;
            let value = self.parse_expression()?;
            pairs.push((key, value));
        }
    }

    fn parse_sequence(&mut self, close: &TokenKind) -> Result<Vec<Node>, ParseError> {
        let mut items = Vec::new();
        loop {
            if &self.peek_token().kind == close {
                self.current += 1;
                return Ok(items);
            }
            if !items.is_empty() {
                self.expect(&TokenKind::Comma, "comma")?;
                if &self.peek_token().kind == close {
                    continue;
                }
            }
            items.push(self.parse_expression()?);
        }
    }

    /// Parses call arguments after an opening parenthesis, consuming the
    /// closing one.
    fn parse_call_args(&mut self) -> Result<(Vec<Node>, Vec<KeywordArg>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        loop {
            if self.peek_token().kind == TokenKind::RightParen {
                self.current += 1;
                return Ok((args, kwargs));
            }
            if !args.is_empty() || !kwargs.is_empty() {
                self.expect(&TokenKind::Comma, "comma")?;
            }
            self.parse_argument(&mut args, &mut kwargs)?;
        }
    }

    fn parse_argument(
        &mut self,
        args: &mut Vec<Node>,
        kwargs: &mut Vec<KeywordArg>,
    ) -> Result<(), ParseError> {
        if let TokenKind::Symbol(name) = &self.peek_token().kind {
            if self.peek_at(1).is_operator("=") {
                let name = name.clone();
                self.current += 2;
                let value = self.parse_expression()?;
                kwargs.push(KeywordArg { name, value });
                return Ok(());
            }
        }

        if !kwargs.is_empty() {
            return Err(ParseError::syntax(
                "positional argument follows keyword argument",
                self.peek_token().loc,
            ));
        }
        args.push(self.parse_expression()?);
        Ok(())
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParseError> {
        let token = self.peek_token().clone();
        if &token.kind == kind {
            self.current += 1;
            Ok(token)
        } else {
            Err(ParseError::syntax(
                format!("Expected {expected}, but got {}", token.kind.describe()),
                token.loc,
            ))
        }
    }

    fn expect_symbol(&mut self, what: &str) -> Result<String, ParseError> {
        let token = self.next_token();
        match token.kind {
            TokenKind::Symbol(name) => Ok(name),
            other => Err(ParseError::syntax(
                format!("expected {what}, but got {}", other.describe()),
                token.loc,
            )),
        }
    }

    fn unclosed(&self, end_tags: &[&str], loc: Location) -> ParseError {
        match self.open_tags.last() {
            Some((opener, opener_loc)) => ParseError::UnclosedTag {
                opener: opener.clone(),
                expected_closer: end_tags.join(" or "),
                loc: *opener_loc,
            },
            None => ParseError::Unterminated {
                construct: "block".to_string(),
                loc,
            },
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            self.depth -= 1;
            return Err(ParseError::TooDeep {
                loc: self.peek_token().loc,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

fn binary(op: BinaryOperator, left: Node, right: Node) -> Node {
    let loc = left.loc();
    Node::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
        loc,
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum ParseError {
    #[error("{message} (at {loc})")]
    Syntax { message: String, loc: Location },
    #[error("Unclosed tag `{opener}` at {loc}, expected `{expected_closer}`")]
    UnclosedTag {
        opener: String,
        expected_closer: String,
        loc: Location,
    },
    #[error("Unterminated {construct} starting at {loc}")]
    Unterminated { construct: String, loc: Location },
    #[error("unknown block tag: {name} (at {loc})")]
    UnknownTag { name: String, loc: Location },
    #[error("Maximum nesting depth exceeded (at {loc})")]
    TooDeep { loc: Location },
}

impl ParseError {
    pub fn syntax(message: impl Into<String>, loc: Location) -> Self {
        Self::Syntax {
            message: message.into(),
            loc,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            ParseError::Syntax { loc, .. }
            | ParseError::UnclosedTag { loc, .. }
            | ParseError::Unterminated { loc, .. }
            | ParseError::UnknownTag { loc, .. }
            | ParseError::TooDeep { loc } => *loc,
        }
    }
}
