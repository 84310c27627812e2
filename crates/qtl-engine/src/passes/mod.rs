//! Compile passes that every environment runs, plus the structural passes
//! contributed by the built-in `req` tag and `sanitizer` filter.

use qtl_templates::Node;

use crate::error::EngineError;

mod builder_value;
mod filter_check;
mod main_builder;
mod parameters;
mod sanitizer;

pub use builder_value::BuilderValueVisitor;
pub use filter_check::FilterCheckVisitor;
pub use main_builder::MainBuilderVisitor;
pub use parameters::ParametersVisitor;
pub use sanitizer::SanitizerVisitor;

/// Longest lookup chain a pass follows before giving up.
pub(crate) const MAX_LOOKUP_DEPTH: usize = 100;

/// Root symbol of a `a.b().c` style chain, following lookup targets and call
/// callees.
pub(crate) fn chain_root(node: &Node) -> Result<Option<&str>, EngineError> {
    let mut current = node;
    for _ in 0..MAX_LOOKUP_DEPTH {
        match current {
            Node::Symbol { name, .. } => return Ok(Some(name)),
            Node::LookupVal { target, .. } => current = &**target,
            Node::FunCall { callee, .. } => current = &**callee,
            _ => return Ok(None),
        }
    }
    Err(EngineError::internal("Max depth reached"))
}

/// Runs `visitor` over `root` the way a compile does: one pre-order walk,
/// then `finish`.
#[cfg(test)]
pub(crate) fn run_visitor(
    visitor: &mut dyn crate::extensions::AstVisitor,
    root: &mut Node,
) -> Result<(), EngineError> {
    use qtl_templates::visitor::walk_node_mut;
    use qtl_templates::visitor::VisitorMut;

    struct Single<'v>(&'v mut dyn crate::extensions::AstVisitor);

    impl VisitorMut for Single<'_> {
        type Error = EngineError;

        fn visit_node_mut(&mut self, node: &mut Node) -> Result<(), EngineError> {
            self.0.on_visit(node)
        }

        fn too_deep(&mut self, _node: &Node) -> EngineError {
            EngineError::internal("Max depth reached")
        }
    }

    walk_node_mut(&mut Single(&mut *visitor), root, 128)?;
    visitor.finish(root)
}
