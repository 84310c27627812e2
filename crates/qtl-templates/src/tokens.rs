use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A 1-based line and column pair pointing into template source.
///
/// Columns count bytes from the start of the line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Byte offsets at which each line of a source text begins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineOffsets(pub Vec<u32>);

impl LineOffsets {
    #[must_use]
    pub fn from_source(source: &str) -> Self {
        let mut offsets = Self::default();
        let bytes = source.as_bytes();
        let mut index = 0;
        while index < bytes.len() {
            match bytes[index] {
                b'\n' => offsets.add_line(index + 1),
                b'\r' => {
                    if bytes.get(index + 1) == Some(&b'\n') {
                        index += 1;
                    }
                    offsets.add_line(index + 1);
                }
                _ => {}
            }
            index += 1;
        }
        offsets
    }

    pub fn add_line(&mut self, offset: usize) {
        self.0.push(u32::try_from(offset).unwrap_or(u32::MAX));
    }

    #[must_use]
    pub fn position_to_line_col(&self, position: usize) -> (usize, usize) {
        let position = u32::try_from(position).unwrap_or(u32::MAX);
        let line = match self.0.binary_search(&position) {
            Ok(exact_line) => exact_line,
            Err(0) => 0,
            Err(next_line) => next_line - 1,
        };

        let col = (position - self.0[line]) as usize;

        (line + 1, col)
    }

    #[must_use]
    pub fn location(&self, position: usize) -> Location {
        let (line, col) = self.position_to_line_col(position);
        Location {
            line: u32::try_from(line).unwrap_or(u32::MAX),
            column: u32::try_from(col + 1).unwrap_or(u32::MAX),
        }
    }
}

impl Default for LineOffsets {
    fn default() -> Self {
        Self(vec![0])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// Raw template text between tags.
    Data(String),
    BlockStart,
    BlockEnd,
    VariableStart,
    VariableEnd,
    Symbol(String),
    Str(String),
    Int(i64),
    Float(f64),
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftCurly,
    RightCurly,
    Comma,
    Colon,
    Pipe,
    Dot,
    Operator(&'static str),
    Eof,
}

impl TokenKind {
    /// Short human-readable name used in parser diagnostics.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Data(_) => "template data",
            TokenKind::BlockStart => "a block start",
            TokenKind::BlockEnd => "a block end",
            TokenKind::VariableStart => "a variable start",
            TokenKind::VariableEnd => "a variable end",
            TokenKind::Symbol(_) => "symbol",
            TokenKind::Str(_) => "string",
            TokenKind::Int(_) => "integer",
            TokenKind::Float(_) => "float",
            TokenKind::LeftParen => "a function start",
            TokenKind::RightParen => "a function end",
            TokenKind::LeftBracket => "left bracket",
            TokenKind::RightBracket => "right bracket",
            TokenKind::LeftCurly => "left curly",
            TokenKind::RightCurly => "right curly",
            TokenKind::Comma => "comma",
            TokenKind::Colon => "colon",
            TokenKind::Pipe => "pipe",
            TokenKind::Dot => "dot",
            TokenKind::Operator(_) => "operator",
            TokenKind::Eof => "end of file",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, loc: Location) -> Self {
        Self { kind, loc }
    }

    #[must_use]
    pub fn is_symbol(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Symbol(value) if value == name)
    }

    #[must_use]
    pub fn is_operator(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Operator(value) if *value == op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_offsets_locations_are_one_based() {
        let offsets = LineOffsets::from_source("ab\ncd\r\nef");
        assert_eq!(offsets.0, vec![0, 3, 7]);
        assert_eq!(offsets.location(0), Location::new(1, 1));
        assert_eq!(offsets.location(4), Location::new(2, 2));
        assert_eq!(offsets.location(7), Location::new(3, 1));
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::new(3, 14).to_string(), "3:14");
    }
}
