use qtl_templates::Location;
use qtl_templates::Node;
use rustc_hash::FxHashMap;

use crate::builtins::WRAPPED_BUILDER_NAME;
use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::VisitStage;

/// Checks `req` declarations and, when none is marked main, wraps the whole
/// template into an implicit main `req`.
#[derive(Default)]
pub struct MainBuilderVisitor {
    declared: FxHashMap<String, Location>,
    has_main: bool,
}

impl MainBuilderVisitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AstVisitor for MainBuilderVisitor {
    fn stage(&self) -> VisitStage {
        VisitStage::Structure
    }

    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        let Node::ExtensionCall {
            extension,
            args,
            loc,
            ..
        } = node
        else {
            return Ok(());
        };
        if extension != "req" {
            return Ok(());
        }

        if let Some(name) = args.first().and_then(Node::as_str_literal) {
            if let Some(previous) = self.declared.get(name) {
                return Err(EngineError::syntax(
                    format!(
                        "We can't declare multiple builder with same name. Duplicated name: {name} (declared at {previous} and {loc})"
                    ),
                    *loc,
                ));
            }
            self.declared.insert(name.to_string(), *loc);
        }

        let is_main = args
            .get(1)
            .and_then(Node::as_literal)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if is_main {
            if self.has_main {
                return Err(EngineError::internal("Only one main builder is allowed."));
            }
            self.has_main = true;
        }
        Ok(())
    }

    fn finish(&mut self, root: &mut Node) -> Result<(), EngineError> {
        if self.has_main {
            return Ok(());
        }

        let Node::Root { children, loc } = root else {
            return Err(EngineError::internal("No root node found."));
        };
        let loc = *loc;
        let body = std::mem::take(children);
        children.push(Node::ExtensionCall {
            extension: "req".to_string(),
            args: vec![
                Node::literal(WRAPPED_BUILDER_NAME, loc),
                Node::literal(true, loc),
            ],
            content: vec![Node::NodeList {
                children: body,
                loc,
            }],
            loc,
        });
        self.has_main = true;
        tracing::debug!("wrapped template body into the implicit main builder");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, main: bool, line: u32) -> Node {
        let loc = Location::new(line, 1);
        Node::ExtensionCall {
            extension: "req".to_string(),
            args: vec![Node::literal(name, loc), Node::literal(main, loc)],
            content: Vec::new(),
            loc,
        }
    }

    fn data(text: &str) -> Node {
        Node::TemplateData {
            value: text.to_string(),
            loc: Location::new(1, 1),
        }
    }

    #[test]
    fn test_wraps_root_without_main() {
        let mut root = Node::Root {
            children: vec![data("select 1")],
            loc: Location::new(1, 1),
        };
        let mut visitor = MainBuilderVisitor::new();
        visitor.finish(&mut root).unwrap();

        let Node::Root { children, .. } = &root else {
            panic!("root replaced");
        };
        assert_eq!(children.len(), 1);
        let Node::ExtensionCall { args, content, .. } = &children[0] else {
            panic!("expected wrapper, got {:?}", children[0]);
        };
        assert_eq!(args[0].as_str_literal(), Some(WRAPPED_BUILDER_NAME));
        assert_eq!(
            content,
            &vec![Node::NodeList {
                children: vec![data("select 1")],
                loc: Location::new(1, 1),
            }]
        );
    }

    #[test]
    fn test_explicit_main_is_left_alone() {
        let mut node = req("user", true, 1);
        let mut root = Node::Root {
            children: vec![node.clone()],
            loc: Location::new(1, 1),
        };
        let mut visitor = MainBuilderVisitor::new();
        visitor.on_visit(&mut node).unwrap();
        let before = root.clone();
        visitor.finish(&mut root).unwrap();
        assert_eq!(root, before);
    }

    #[test]
    fn test_second_main_is_internal_error() {
        let mut visitor = MainBuilderVisitor::new();
        visitor.on_visit(&mut req("a", true, 1)).unwrap();
        let err = visitor.on_visit(&mut req("b", true, 2)).unwrap_err();
        assert!(matches!(err, EngineError::Internal(ref m) if m == "Only one main builder is allowed."));
    }

    #[test]
    fn test_duplicate_name_reports_both_locations() {
        let mut visitor = MainBuilderVisitor::new();
        visitor.on_visit(&mut req("a", false, 1)).unwrap();
        let err = visitor.on_visit(&mut req("a", false, 3)).unwrap_err();
        assert!(matches!(err, EngineError::Syntax(_)));
        assert!(err
            .to_string()
            .contains("Duplicated name: a (declared at 1:1 and 3:1)"));
    }

    #[test]
    fn test_non_root_is_internal_error() {
        let mut visitor = MainBuilderVisitor::new();
        let err = visitor.finish(&mut data("x")).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
