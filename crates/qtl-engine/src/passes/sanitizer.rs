use qtl_templates::Node;

use crate::builtins::RAW_FILTER_NAME;
use crate::builtins::SANITIZER_FILTER_NAME;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::VisitStage;

/// Wraps every value that reaches template output in the `sanitizer` filter.
///
/// Each `Output` is rewritten when the walk reaches it, before its children
/// are visited. Symbols, lookups, calls and filter results inside it are
/// replaced by `sanitizer(<node>)`; the wrapped node is not rewritten again.
/// A `raw` filter stops the walk for everything below it, including sibling
/// arguments of the filtered value. Conditions of inline `if` expressions
/// are control flow and are left untouched.
#[derive(Default)]
pub struct SanitizerVisitor;

impl AstVisitor for SanitizerVisitor {
    fn stage(&self) -> VisitStage {
        VisitStage::Sanitize
    }

    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        if matches!(node, Node::Output { .. }) {
            sanitize_children(node, true);
        }
        Ok(())
    }
}

fn sanitize_children(parent: &mut Node, has_output_ancestor: bool) {
    let in_output = has_output_ancestor || matches!(parent, Node::Output { .. });
    match parent {
        Node::InlineIf {
            cond,
            body,
            else_body,
            ..
        } => {
            sanitize_child(cond, false);
            sanitize_child(body, in_output);
            if let Some(else_body) = else_body {
                sanitize_child(else_body, in_output);
            }
        }
        other => {
            for child in other.children_mut() {
                sanitize_child(child, in_output);
            }
        }
    }
}

fn sanitize_child(child: &mut Node, in_output: bool) {
    if child.is_filter_named(RAW_FILTER_NAME) {
        return;
    }

    if matches!(
        child,
        Node::Symbol { .. } | Node::LookupVal { .. } | Node::FunCall { .. } | Node::Filter { .. }
    ) {
        if in_output {
            let loc = child.loc();
            child.replace_with(|original| Node::filter(SANITIZER_FILTER_NAME, original, loc));
        }
        return;
    }

    sanitize_children(child, in_output);
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::visitor::walk_node;
    use qtl_templates::visitor::Visitor;
    use qtl_templates::NoExtensions;

    use super::*;
    use crate::passes::run_visitor;

    #[derive(Default)]
    struct FilterTargets {
        sanitized: Vec<String>,
    }

    impl Visitor for FilterTargets {
        fn visit_node(&mut self, node: &Node) {
            if let Node::Filter { name, args, .. } = node {
                if name == SANITIZER_FILTER_NAME {
                    self.sanitized.push(describe(&args[0]));
                }
            }
            walk_node(self, node);
        }
    }

    fn describe(node: &Node) -> String {
        match node {
            Node::Symbol { name, .. } => name.clone(),
            Node::LookupVal { target, key, .. } => {
                format!("{}.{}", describe(target), key.as_str_literal().unwrap_or("?"))
            }
            Node::Filter { name, args, .. } => format!("{}|{name}", describe(&args[0])),
            Node::FunCall { callee, .. } => format!("{}()", describe(callee)),
            other => other.kind().to_string(),
        }
    }

    fn sanitized(source: &str) -> Vec<String> {
        let mut root = parse_template(source, &NoExtensions).unwrap();
        run_visitor(&mut SanitizerVisitor, &mut root).unwrap();
        let mut collector = FilterTargets::default();
        collector.visit_node(&root);
        collector.sanitized
    }

    #[test]
    fn test_output_values_are_wrapped() {
        assert_eq!(
            sanitized("select * from t where id = {{ params.id }} and n = {{ name | upper }}"),
            vec!["params.id", "name|upper"]
        );
    }

    #[test]
    fn test_wrapped_nodes_are_not_wrapped_again() {
        assert_eq!(sanitized("{{ f(a, b) }}"), vec!["f()"]);
    }

    #[test]
    fn test_raw_stops_the_walk() {
        assert!(sanitized("{{ params.col | raw }}").is_empty());
        assert!(sanitized("{{ (a | raw) ~ b }}").contains(&"b".to_string()));
    }

    #[test]
    fn test_control_flow_is_untouched() {
        assert_eq!(
            sanitized("{% if params.admin %}{{ a if params.flag else b }}{% endif %}"),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_literals_are_left_alone() {
        assert!(sanitized("{{ 1 + 2 }}{{ 'x' }}").is_empty());
    }
}
