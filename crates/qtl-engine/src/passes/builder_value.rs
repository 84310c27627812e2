use qtl_templates::Node;
use rustc_hash::FxHashSet;

use super::chain_root;
use crate::builtins::EXECUTE_FILTER_NAME;
use crate::error::EngineError;
use crate::extensions::AstVisitor;

/// Rewrites `builder.value()` on `req` and `cache` variables into the
/// `execute` filter.
///
/// Builders are recorded as their declaring tag is visited, so only calls
/// after the declaration are rewritten.
pub struct BuilderValueVisitor {
    extensions: FxHashSet<String>,
    builders: FxHashSet<String>,
}

impl BuilderValueVisitor {
    pub fn new(extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(ToString::to_string).collect(),
            builders: FxHashSet::default(),
        }
    }
}

impl AstVisitor for BuilderValueVisitor {
    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        match node {
            Node::ExtensionCall {
                extension, args, ..
            } if self.extensions.contains(extension.as_str()) => {
                if let Some(name) = args.first().and_then(Node::as_str_literal) {
                    self.builders.insert(name.to_string());
                }
            }
            Node::FunCall {
                callee, args, loc, ..
            } if args.is_empty() => {
                let Node::LookupVal { target, key, .. } = &**callee else {
                    return Ok(());
                };
                if key.as_str_literal() != Some("value") {
                    return Ok(());
                }
                let Some(root) = chain_root(target)? else {
                    return Ok(());
                };
                if !self.builders.contains(root) {
                    return Ok(());
                }

                let loc = *loc;
                node.replace_with(|call| match call {
                    Node::FunCall { callee, .. } => match *callee {
                        Node::LookupVal { target, .. } => {
                            Node::filter(EXECUTE_FILTER_NAME, *target, loc)
                        }
                        other => other,
                    },
                    other => other,
                });
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use qtl_templates::Location;

    use super::*;

    fn symbol(name: &str) -> Node {
        Node::Symbol {
            name: name.to_string(),
            loc: Location::new(1, 1),
        }
    }

    fn value_call(target: Node) -> Node {
        Node::FunCall {
            callee: Box::new(Node::LookupVal {
                target: Box::new(target),
                key: Box::new(Node::literal("value", Location::new(1, 1))),
                loc: Location::new(1, 1),
            }),
            args: Vec::new(),
            kwargs: Vec::new(),
            loc: Location::new(1, 5),
        }
    }

    fn declare(visitor: &mut BuilderValueVisitor, extension: &str, name: &str) {
        let mut node = Node::ExtensionCall {
            extension: extension.to_string(),
            args: vec![Node::literal(name, Location::new(1, 1))],
            content: Vec::new(),
            loc: Location::new(1, 1),
        };
        visitor.on_visit(&mut node).unwrap();
    }

    #[test]
    fn test_declared_builder_value_becomes_execute() {
        let mut visitor = BuilderValueVisitor::new(&["req", "cache"]);
        declare(&mut visitor, "req", "user");

        let mut node = value_call(symbol("user"));
        visitor.on_visit(&mut node).unwrap();
        assert_eq!(node, Node::filter("execute", symbol("user"), Location::new(1, 5)));
    }

    #[test]
    fn test_cache_variables_count_as_builders() {
        let mut visitor = BuilderValueVisitor::new(&["req", "cache"]);
        declare(&mut visitor, "cache", "cached");

        let mut node = value_call(symbol("cached"));
        visitor.on_visit(&mut node).unwrap();
        assert!(node.is_filter_named("execute"));
    }

    #[test]
    fn test_unknown_variables_are_untouched() {
        let mut visitor = BuilderValueVisitor::new(&["req", "cache"]);
        let mut node = value_call(symbol("user"));
        let before = node.clone();
        visitor.on_visit(&mut node).unwrap();
        assert_eq!(node, before);
    }

    #[test]
    fn test_non_symbol_root_is_untouched() {
        let mut visitor = BuilderValueVisitor::new(&["req"]);
        declare(&mut visitor, "req", "user");
        let mut node = value_call(Node::literal("user", Location::new(1, 1)));
        let before = node.clone();
        visitor.on_visit(&mut node).unwrap();
        assert_eq!(node, before);
    }
}
