use crate::nodes::Node;

/// Read-only traversal of a template syntax tree.
pub trait Visitor {
    fn visit_node(&mut self, node: &Node) {
        walk_node(self, node);
    }
}

/// Visit the children of `node` in source order.
pub fn walk_node<V: Visitor + ?Sized>(visitor: &mut V, node: &Node) {
    for child in node.children() {
        visitor.visit_node(child);
    }
}

/// Mutable pre-order traversal that may fail.
///
/// `visit_node_mut` runs on a node before its children, so a node replaced
/// during the visit is walked in its new shape.
pub trait VisitorMut {
    type Error;

    fn visit_node_mut(&mut self, node: &mut Node) -> Result<(), Self::Error>;

    /// Error reported when the tree is nested deeper than the walk allows.
    fn too_deep(&mut self, node: &Node) -> Self::Error;
}

pub fn walk_node_mut<V: VisitorMut + ?Sized>(
    visitor: &mut V,
    node: &mut Node,
    max_depth: usize,
) -> Result<(), V::Error> {
    walk_at_depth(visitor, node, 0, max_depth)
}

fn walk_at_depth<V: VisitorMut + ?Sized>(
    visitor: &mut V,
    node: &mut Node,
    depth: usize,
    max_depth: usize,
) -> Result<(), V::Error> {
    if depth > max_depth {
        return Err(visitor.too_deep(node));
    }

    visitor.visit_node_mut(node)?;
    for child in node.children_mut() {
        walk_at_depth(visitor, child, depth + 1, max_depth)?;
    }
    Ok(())
}
