//! Lexing and parsing of SQL templates.
//!
//! Templates use a Nunjucks-style syntax: `{{ expr }}` outputs, `{% tag %}`
//! statements and `{# … #}` comments. The parser produces a [`Node`] tree
//! rooted at [`Node::Root`]; tags other than `if`, `for` and `set` are
//! delegated to a [`TagExtensions`] implementation.
//!
//! ```ignore
//! use qtl_templates::{parse_template, NoExtensions};
//!
//! let root = parse_template("select {{ params.id }}", &NoExtensions)?;
//! ```

mod lexer;
mod nodes;
mod parser;
mod tokens;
pub mod visitor;

pub use lexer::Lexer;
pub use nodes::BinaryOperator;
pub use nodes::KeywordArg;
pub use nodes::Node;
pub use nodes::UnaryOperator;
pub use parser::NoExtensions;
pub use parser::ParseError;
pub use parser::Parser;
pub use parser::TagExtensions;
pub use parser::MAX_NESTING;
pub use tokens::LineOffsets;
pub use tokens::Location;
pub use tokens::Token;
pub use tokens::TokenKind;

/// Tokenize and parse `source` into a syntax tree.
pub fn parse_template(source: &str, extensions: &dyn TagExtensions) -> Result<Node, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    tracing::trace!(tokens = tokens.len(), "tokenized template");
    Parser::new(tokens, extensions).parse()
}
