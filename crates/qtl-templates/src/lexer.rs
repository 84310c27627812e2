use crate::parser::ParseError;
use crate::tokens::LineOffsets;
use crate::tokens::Location;
use crate::tokens::Token;
use crate::tokens::TokenKind;

const BLOCK_TAG_START: &str = "{%";
const BLOCK_TAG_END: &str = "%}";
const VARIABLE_TAG_START: &str = "{{";
const VARIABLE_TAG_END: &str = "}}";
const COMMENT_TAG_START: &str = "{#";
const COMMENT_TAG_END: &str = "#}";
const WHITESPACE_CONTROL: char = '-';

const TWO_CHAR_OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "//", "**"];
const ONE_CHAR_OPERATORS: [&str; 9] = ["<", ">", "=", "+", "-", "*", "/", "%", "~"];

pub struct Lexer<'a> {
    source: &'a str,
    line_offsets: LineOffsets,
    start: usize,
    current: usize,
    trim_next_data: bool,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            line_offsets: LineOffsets::from_source(source),
            start: 0,
            current: 0,
            trim_next_data: false,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();

        while !self.is_at_end() {
            self.start = self.current;

            if self.starts_with(BLOCK_TAG_START) {
                self.lex_tag(
                    &mut tokens,
                    TokenKind::BlockStart,
                    BLOCK_TAG_END,
                    TokenKind::BlockEnd,
                )?;
            } else if self.starts_with(VARIABLE_TAG_START) {
                self.lex_tag(
                    &mut tokens,
                    TokenKind::VariableStart,
                    VARIABLE_TAG_END,
                    TokenKind::VariableEnd,
                )?;
            } else if self.starts_with(COMMENT_TAG_START) {
                self.lex_comment(&mut tokens)?;
            } else {
                self.lex_data(&mut tokens);
            }
        }

        tokens.push(Token::new(TokenKind::Eof, self.location(self.current)));
        Ok(tokens)
    }

    fn lex_data(&mut self, tokens: &mut Vec<Token>) {
        while !self.is_at_end() {
            if self.starts_with(BLOCK_TAG_START)
                || self.starts_with(VARIABLE_TAG_START)
                || self.starts_with(COMMENT_TAG_START)
            {
                break;
            }
            self.consume();
        }

        let mut text = &self.source[self.start..self.current];
        if std::mem::take(&mut self.trim_next_data) {
            text = text.trim_start();
        }
        if !text.is_empty() {
            tokens.push(Token::new(
                TokenKind::Data(text.to_string()),
                self.location(self.start),
            ));
        }
    }

    fn lex_tag(
        &mut self,
        tokens: &mut Vec<Token>,
        start_kind: TokenKind,
        end: &str,
        end_kind: TokenKind,
    ) -> Result<(), ParseError> {
        let open_loc = self.location(self.start);
        self.consume_n(2);

        if self.peek() == WHITESPACE_CONTROL {
            self.consume();
            trim_trailing_data(tokens);
        }
        tokens.push(Token::new(start_kind, open_loc));

        loop {
            self.skip_whitespace();

            if self.is_at_end() {
                return Err(ParseError::Unterminated {
                    construct: if end == BLOCK_TAG_END { "tag" } else { "variable" }.to_string(),
                    loc: open_loc,
                });
            }

            if self.peek() == WHITESPACE_CONTROL && self.source[self.current + 1..].starts_with(end)
            {
                let loc = self.location(self.current);
                self.consume_n(1 + end.len());
                self.trim_next_data = true;
                tokens.push(Token::new(end_kind, loc));
                return Ok(());
            }

            if self.starts_with(end) {
                let loc = self.location(self.current);
                self.consume_n(end.len());
                tokens.push(Token::new(end_kind, loc));
                return Ok(());
            }

            let token = self.lex_code_token()?;
            tokens.push(token);
        }
    }

    fn lex_comment(&mut self, tokens: &mut Vec<Token>) -> Result<(), ParseError> {
        let open_loc = self.location(self.start);
        self.consume_n(2);

        let Some(length) = self.source[self.current..].find(COMMENT_TAG_END) else {
            return Err(ParseError::Unterminated {
                construct: "comment".to_string(),
                loc: open_loc,
            });
        };

        let content = &self.source[self.current..self.current + length];
        if content.starts_with(WHITESPACE_CONTROL) {
            trim_trailing_data(tokens);
        }
        if content.len() > 1 && content.ends_with(WHITESPACE_CONTROL) {
            self.trim_next_data = true;
        }

        self.consume_n(length + COMMENT_TAG_END.len());
        Ok(())
    }

    fn lex_code_token(&mut self) -> Result<Token, ParseError> {
        let start = self.current;
        let loc = self.location(start);
        let c = self.peek();

        let kind = match c {
            '"' | '\'' => self.lex_string(c, loc)?,
            c if c.is_ascii_digit() => self.lex_number(loc)?,
            c if c.is_alphabetic() || c == '_' => {
                while !self.is_at_end() && (self.peek().is_alphanumeric() || self.peek() == '_') {
                    self.consume();
                }
                TokenKind::Symbol(self.source[start..self.current].to_string())
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | ':' | '|' | '.' => {
                self.consume();
                match c {
                    '(' => TokenKind::LeftParen,
                    ')' => TokenKind::RightParen,
                    '[' => TokenKind::LeftBracket,
                    ']' => TokenKind::RightBracket,
                    '{' => TokenKind::LeftCurly,
                    '}' => TokenKind::RightCurly,
                    ',' => TokenKind::Comma,
                    ':' => TokenKind::Colon,
                    '|' => TokenKind::Pipe,
                    _ => TokenKind::Dot,
                }
            }
            _ => {
                let op = TWO_CHAR_OPERATORS
                    .iter()
                    .chain(ONE_CHAR_OPERATORS.iter())
                    .find(|op| self.starts_with(op))
                    .copied()
                    .ok_or_else(|| {
                        ParseError::syntax(format!("Unexpected character `{c}`"), loc)
                    })?;
                self.consume_n(op.len());
                TokenKind::Operator(op)
            }
        };

        Ok(Token::new(kind, loc))
    }

    fn lex_string(&mut self, quote: char, loc: Location) -> Result<TokenKind, ParseError> {
        self.consume();
        let mut value = String::new();

        while !self.is_at_end() {
            let c = self.consume();
            if c == quote {
                return Ok(TokenKind::Str(value));
            }
            if c == '\\' && !self.is_at_end() {
                match self.consume() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    other => value.push(other),
                }
            } else {
                value.push(c);
            }
        }

        Err(ParseError::Unterminated {
            construct: "string".to_string(),
            loc,
        })
    }

    fn lex_number(&mut self, loc: Location) -> Result<TokenKind, ParseError> {
        let start = self.current;
        while self.peek().is_ascii_digit() {
            self.consume();
        }

        let is_float = self.peek() == '.' && self.peek_next().is_ascii_digit();
        if is_float {
            self.consume();
            while self.peek().is_ascii_digit() {
                self.consume();
            }
        }

        let text = &self.source[start..self.current];
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| ParseError::syntax(format!("Invalid number `{text}`"), loc))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| ParseError::syntax(format!("Invalid number `{text}`"), loc))
        }
    }

    fn location(&self, position: usize) -> Location {
        self.line_offsets.location(position)
    }

    #[inline]
    fn peek(&self) -> char {
        self.source[self.current..].chars().next().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    fn starts_with(&self, pattern: &str) -> bool {
        self.source[self.current..].starts_with(pattern)
    }

    #[inline]
    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn consume(&mut self) -> char {
        let c = self.peek();
        self.current += c.len_utf8().max(1);
        c
    }

    fn consume_n(&mut self, count: usize) {
        for _ in 0..count {
            self.consume();
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() && self.peek().is_whitespace() {
            self.consume();
        }
    }
}

fn trim_trailing_data(tokens: &mut Vec<Token>) {
    if let Some(Token {
        kind: TokenKind::Data(text),
        ..
    }) = tokens.last_mut()
    {
        let trimmed_len = text.trim_end().len();
        text.truncate(trimmed_len);
        if text.is_empty() {
            tokens.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_data_and_variable() {
        assert_eq!(
            kinds("select {{ params.id }}"),
            vec![
                TokenKind::Data("select ".to_string()),
                TokenKind::VariableStart,
                TokenKind::Symbol("params".to_string()),
                TokenKind::Dot,
                TokenKind::Symbol("id".to_string()),
                TokenKind::VariableEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_block_with_literals() {
        assert_eq!(
            kinds("{% error \"it's\" 1 2.5 %}"),
            vec![
                TokenKind::BlockStart,
                TokenKind::Symbol("error".to_string()),
                TokenKind::Str("it's".to_string()),
                TokenKind::Int(1),
                TokenKind::Float(2.5),
                TokenKind::BlockEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_operators_prefer_longest_match() {
        assert_eq!(
            kinds("{{ a // b ** 2 != c }}"),
            vec![
                TokenKind::VariableStart,
                TokenKind::Symbol("a".to_string()),
                TokenKind::Operator("//"),
                TokenKind::Symbol("b".to_string()),
                TokenKind::Operator("**"),
                TokenKind::Int(2),
                TokenKind::Operator("!="),
                TokenKind::Symbol("c".to_string()),
                TokenKind::VariableEnd,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_dropped() {
        assert_eq!(
            kinds("a{# ignored {{ x }} #}b"),
            vec![
                TokenKind::Data("a".to_string()),
                TokenKind::Data("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_whitespace_control_trims_neighbouring_data() {
        assert_eq!(
            kinds("a  \n {%- set x = 1 -%}\n  b"),
            vec![
                TokenKind::Data("a".to_string()),
                TokenKind::BlockStart,
                TokenKind::Symbol("set".to_string()),
                TokenKind::Symbol("x".to_string()),
                TokenKind::Operator("="),
                TokenKind::Int(1),
                TokenKind::BlockEnd,
                TokenKind::Data("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lone_brace_is_data() {
        assert_eq!(
            kinds("{a}"),
            vec![TokenKind::Data("{a}".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_token_locations() {
        let tokens = Lexer::new("\n{% req user %}").tokenize().unwrap();
        assert_eq!(tokens[1].loc, Location::new(2, 1));
        assert_eq!(tokens[2].loc, Location::new(2, 4));
        assert_eq!(tokens[3].loc, Location::new(2, 8));
    }

    mod errors {
        use super::*;

        #[test]
        fn test_unterminated_tag() {
            let err = Lexer::new("select {{ id").tokenize().unwrap_err();
            assert_eq!(
                err,
                ParseError::Unterminated {
                    construct: "variable".to_string(),
                    loc: Location::new(1, 8),
                }
            );
        }

        #[test]
        fn test_unterminated_string() {
            let err = Lexer::new("{% error \"oops %}").tokenize().unwrap_err();
            assert!(matches!(err, ParseError::Unterminated { ref construct, .. } if construct == "string"));
        }

        #[test]
        fn test_unterminated_comment() {
            let err = Lexer::new("{# never closed").tokenize().unwrap_err();
            assert!(matches!(err, ParseError::Unterminated { ref construct, .. } if construct == "comment"));
        }

        #[test]
        fn test_unexpected_character() {
            let err = Lexer::new("{{ a ? b }}").tokenize().unwrap_err();
            assert_eq!(err, ParseError::syntax("Unexpected character `?`", Location::new(1, 6)));
        }
    }
}
