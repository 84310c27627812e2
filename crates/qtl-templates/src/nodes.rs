use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::tokens::Location;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeywordArg {
    pub name: String,
    pub value: Node,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Or,
    And,
    In,
    NotIn,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Not,
    Neg,
    Pos,
}

/// A node of the template syntax tree.
///
/// The tree is closed: passes match exhaustively on it and replace nodes in
/// place through `&mut Node`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Node {
    Root {
        children: Vec<Node>,
        loc: Location,
    },
    NodeList {
        children: Vec<Node>,
        loc: Location,
    },
    /// Everything that renders text: template data and `{{ … }}` expressions.
    Output {
        children: Vec<Node>,
        loc: Location,
    },
    TemplateData {
        value: String,
        loc: Location,
    },
    Literal {
        value: JsonValue,
        loc: Location,
    },
    Symbol {
        name: String,
        loc: Location,
    },
    LookupVal {
        target: Box<Node>,
        key: Box<Node>,
        loc: Location,
    },
    FunCall {
        callee: Box<Node>,
        args: Vec<Node>,
        kwargs: Vec<KeywordArg>,
        loc: Location,
    },
    /// A filter application; `args[0]` is the filtered value.
    Filter {
        name: String,
        args: Vec<Node>,
        kwargs: Vec<KeywordArg>,
        loc: Location,
    },
    /// A call into a registered tag extension. `content` holds the lazily
    /// rendered body blocks.
    ExtensionCall {
        extension: String,
        args: Vec<Node>,
        content: Vec<Node>,
        loc: Location,
    },
    If {
        cond: Box<Node>,
        body: Vec<Node>,
        else_body: Vec<Node>,
        loc: Location,
    },
    For {
        targets: Vec<String>,
        iter: Box<Node>,
        body: Vec<Node>,
        else_body: Vec<Node>,
        loc: Location,
    },
    Set {
        targets: Vec<String>,
        value: Box<Node>,
        loc: Location,
    },
    /// The rendered body of a block `set`.
    Capture {
        body: Vec<Node>,
        loc: Location,
    },
    Array {
        items: Vec<Node>,
        loc: Location,
    },
    Dict {
        pairs: Vec<(Node, Node)>,
        loc: Location,
    },
    BinOp {
        op: BinaryOperator,
        left: Box<Node>,
        right: Box<Node>,
        loc: Location,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Node>,
        loc: Location,
    },
    InlineIf {
        cond: Box<Node>,
        body: Box<Node>,
        else_body: Option<Box<Node>>,
        loc: Location,
    },
}

impl Node {
    #[must_use]
    pub fn loc(&self) -> Location {
        match self {
            Node::Root { loc, .. }
            | Node::NodeList { loc, .. }
            | Node::Output { loc, .. }
            | Node::TemplateData { loc, .. }
            | Node::Literal { loc, .. }
            | Node::Symbol { loc, .. }
            | Node::LookupVal { loc, .. }
            | Node::FunCall { loc, .. }
            | Node::Filter { loc, .. }
            | Node::ExtensionCall { loc, .. }
            | Node::If { loc, .. }
            | Node::For { loc, .. }
            | Node::Set { loc, .. }
            | Node::Capture { loc, .. }
            | Node::Array { loc, .. }
            | Node::Dict { loc, .. }
            | Node::BinOp { loc, .. }
            | Node::UnaryOp { loc, .. }
            | Node::InlineIf { loc, .. } => *loc,
        }
    }

    /// Variant name, used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Root { .. } => "Root",
            Node::NodeList { .. } => "NodeList",
            Node::Output { .. } => "Output",
            Node::TemplateData { .. } => "TemplateData",
            Node::Literal { .. } => "Literal",
            Node::Symbol { .. } => "Symbol",
            Node::LookupVal { .. } => "LookupVal",
            Node::FunCall { .. } => "FunCall",
            Node::Filter { .. } => "Filter",
            Node::ExtensionCall { .. } => "ExtensionCall",
            Node::If { .. } => "If",
            Node::For { .. } => "For",
            Node::Set { .. } => "Set",
            Node::Capture { .. } => "Capture",
            Node::Array { .. } => "Array",
            Node::Dict { .. } => "Dict",
            Node::BinOp { .. } => "BinOp",
            Node::UnaryOp { .. } => "UnaryOp",
            Node::InlineIf { .. } => "InlineIf",
        }
    }

    #[must_use]
    pub fn literal(value: impl Into<JsonValue>, loc: Location) -> Self {
        Node::Literal {
            value: value.into(),
            loc,
        }
    }

    /// Wraps `target` in a single-argument filter.
    #[must_use]
    pub fn filter(name: impl Into<String>, target: Node, loc: Location) -> Self {
        Node::Filter {
            name: name.into(),
            args: vec![target],
            kwargs: Vec::new(),
            loc,
        }
    }

    #[must_use]
    pub fn is_filter_named(&self, filter_name: &str) -> bool {
        matches!(self, Node::Filter { name, .. } if name == filter_name)
    }

    #[must_use]
    pub fn as_literal(&self) -> Option<&JsonValue> {
        match self {
            Node::Literal { value, .. } => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str_literal(&self) -> Option<&str> {
        self.as_literal().and_then(JsonValue::as_str)
    }

    /// Replaces this node with the result of `f`, which receives the old node
    /// by value.
    pub fn replace_with(&mut self, f: impl FnOnce(Node) -> Node) {
        let loc = self.loc();
        let old = std::mem::replace(
            self,
            Node::NodeList {
                children: Vec::new(),
                loc,
            },
        );
        *self = f(old);
    }

    /// Direct children in source order.
    #[must_use]
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Root { children, .. }
            | Node::NodeList { children, .. }
            | Node::Output { children, .. } => children.iter().collect(),
            Node::TemplateData { .. } | Node::Literal { .. } | Node::Symbol { .. } => Vec::new(),
            Node::LookupVal { target, key, .. } => vec![target.as_ref(), key.as_ref()],
            Node::FunCall {
                callee,
                args,
                kwargs,
                ..
            } => std::iter::once(callee.as_ref())
                .chain(args.iter())
                .chain(kwargs.iter().map(|kwarg| &kwarg.value))
                .collect(),
            Node::Filter { args, kwargs, .. } => args
                .iter()
                .chain(kwargs.iter().map(|kwarg| &kwarg.value))
                .collect(),
            Node::ExtensionCall { args, content, .. } => args.iter().chain(content.iter()).collect(),
            Node::If {
                cond,
                body,
                else_body,
                ..
            } => std::iter::once(cond.as_ref())
                .chain(body.iter())
                .chain(else_body.iter())
                .collect(),
            Node::For {
                iter,
                body,
                else_body,
                ..
            } => std::iter::once(iter.as_ref())
                .chain(body.iter())
                .chain(else_body.iter())
                .collect(),
            Node::Set { value, .. } => vec![value.as_ref()],
            Node::Capture { body, .. } => body.iter().collect(),
            Node::Array { items, .. } => items.iter().collect(),
            Node::Dict { pairs, .. } => pairs.iter().flat_map(|(key, value)| [key, value]).collect(),
            Node::BinOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Node::UnaryOp { operand, .. } => vec![operand.as_ref()],
            Node::InlineIf {
                cond,
                body,
                else_body,
                ..
            } => {
                let mut children = vec![cond.as_ref(), body.as_ref()];
                children.extend(else_body.as_deref());
                children
            }
        }
    }

    /// Mutable direct children in source order.
    pub fn children_mut(&mut self) -> Vec<&mut Node> {
        match self {
            Node::Root { children, .. }
            | Node::NodeList { children, .. }
            | Node::Output { children, .. } => children.iter_mut().collect(),
            Node::TemplateData { .. } | Node::Literal { .. } | Node::Symbol { .. } => Vec::new(),
            Node::LookupVal { target, key, .. } => vec![target.as_mut(), key.as_mut()],
            Node::FunCall {
                callee,
                args,
                kwargs,
                ..
            } => std::iter::once(callee.as_mut())
                .chain(args.iter_mut())
                .chain(kwargs.iter_mut().map(|kwarg| &mut kwarg.value))
                .collect(),
            Node::Filter { args, kwargs, .. } => args
                .iter_mut()
                .chain(kwargs.iter_mut().map(|kwarg| &mut kwarg.value))
                .collect(),
            Node::ExtensionCall { args, content, .. } => {
                args.iter_mut().chain(content.iter_mut()).collect()
            }
            Node::If {
                cond,
                body,
                else_body,
                ..
            } => std::iter::once(cond.as_mut())
                .chain(body.iter_mut())
                .chain(else_body.iter_mut())
                .collect(),
            Node::For {
                iter,
                body,
                else_body,
                ..
            } => std::iter::once(iter.as_mut())
                .chain(body.iter_mut())
                .chain(else_body.iter_mut())
                .collect(),
            Node::Set { value, .. } => vec![value.as_mut()],
            Node::Capture { body, .. } => body.iter_mut().collect(),
            Node::Array { items, .. } => items.iter_mut().collect(),
            Node::Dict { pairs, .. } => pairs
                .iter_mut()
                .flat_map(|(key, value)| [key, value])
                .collect(),
            Node::BinOp { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            Node::UnaryOp { operand, .. } => vec![operand.as_mut()],
            Node::InlineIf {
                cond,
                body,
                else_body,
                ..
            } => {
                let mut children = vec![cond.as_mut(), body.as_mut()];
                children.extend(else_body.as_deref_mut());
                children
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(name: &str) -> Node {
        Node::Symbol {
            name: name.to_string(),
            loc: Location::new(1, 1),
        }
    }

    #[test]
    fn test_replace_with_wraps_original() {
        let mut node = symbol("id");
        node.replace_with(|old| Node::filter("sanitizer", old, Location::new(1, 1)));
        assert_eq!(
            node,
            Node::Filter {
                name: "sanitizer".to_string(),
                args: vec![symbol("id")],
                kwargs: Vec::new(),
                loc: Location::new(1, 1),
            }
        );
    }

    #[test]
    fn test_children_follow_source_order() {
        let node = Node::FunCall {
            callee: Box::new(symbol("f")),
            args: vec![symbol("a")],
            kwargs: vec![KeywordArg {
                name: "k".to_string(),
                value: symbol("b"),
            }],
            loc: Location::new(1, 1),
        };
        let names: Vec<_> = node
            .children()
            .into_iter()
            .filter_map(|child| match child {
                Node::Symbol { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["f", "a", "b"]);
    }

    #[test]
    fn test_serialized_shape_is_tagged() {
        let json = serde_json::to_value(symbol("x")).unwrap();
        assert_eq!(json["type"], "Symbol");
        assert_eq!(json["name"], "x");
    }
}
