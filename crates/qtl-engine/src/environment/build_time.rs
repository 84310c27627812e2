use std::sync::Arc;

use indexmap::IndexMap;
use qtl_templates::parse_template;
use qtl_templates::visitor::walk_node_mut;
use qtl_templates::visitor::VisitorMut;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use qtl_templates::TagExtensions;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::EngineError;
use crate::extensions::AstVisitor;
use crate::extensions::ExtensionRegistry;
use crate::extensions::FilterBuilder;
use crate::extensions::TagBuilder;
use crate::passes::BuilderValueVisitor;
use crate::passes::FilterCheckVisitor;
use crate::passes::ParametersVisitor;

/// Deepest syntax tree a compile pass walks.
pub const MAX_AST_DEPTH: usize = 128;

/// Extensions whose first argument names a query builder variable.
const BUILDER_EXTENSIONS: [&str; 2] = ["req", "cache"];

/// A parsed and rewritten template, ready to render.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub root: Node,
    pub metadata: IndexMap<String, JsonValue>,
}

/// Compiles templates with the build-time halves of registered extensions.
pub struct BuildTimeEnvironment {
    tags: FxHashMap<&'static str, Arc<dyn TagBuilder>>,
    tag_builders: Vec<Arc<dyn TagBuilder>>,
    filter_builders: Vec<Arc<dyn FilterBuilder>>,
    parameter_root: String,
}

impl BuildTimeEnvironment {
    pub fn new(registry: &ExtensionRegistry, parameter_root: impl Into<String>) -> Self {
        let mut tags = FxHashMap::default();
        for builder in registry.tag_builders() {
            for tag in builder.tags() {
                tags.insert(*tag, Arc::clone(builder));
            }
        }

        Self {
            tags,
            tag_builders: registry.tag_builders().to_vec(),
            filter_builders: registry.filter_builders().to_vec(),
            parameter_root: parameter_root.into(),
        }
    }

    /// Parses `source`, runs every compile pass over the tree and gathers
    /// their metadata.
    pub fn compile(&self, source: &str) -> Result<CompiledTemplate, EngineError> {
        let mut root = parse_template(source, self)?;
        let mut visitors = self.visitors();
        // Stable, so registration order holds within a stage.
        visitors.sort_by_key(|visitor| visitor.stage());

        let mut traversal = Traversal {
            visitors: &mut visitors,
        };
        walk_node_mut(&mut traversal, &mut root, MAX_AST_DEPTH)?;

        for visitor in &mut visitors {
            visitor.finish(&mut root)?;
        }

        let metadata = visitors
            .iter()
            .filter_map(|visitor| visitor.metadata())
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        Ok(CompiledTemplate { root, metadata })
    }

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        let mut visitors: Vec<Box<dyn AstVisitor>> = Vec::new();
        for builder in &self.tag_builders {
            visitors.extend(builder.visitors());
        }
        for builder in &self.filter_builders {
            visitors.extend(builder.visitors());
        }

        visitors.push(Box::new(BuilderValueVisitor::new(&BUILDER_EXTENSIONS)));
        visitors.push(Box::new(ParametersVisitor::new(
            self.parameter_root.clone(),
            self.filter_builders
                .iter()
                .map(|builder| builder.filter_name().to_string())
                .filter(|name| name.starts_with("is_")),
        )));
        visitors.push(Box::new(FilterCheckVisitor::new(
            self.filter_builders
                .iter()
                .map(|builder| builder.filter_name().to_string()),
        )));
        visitors
    }
}

impl TagExtensions for BuildTimeEnvironment {
    fn is_extension_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    fn parse_extension(&self, name: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
        match self.tags.get(name) {
            Some(builder) => builder.parse(name, parser),
            None => Err(ParseError::UnknownTag {
                name: name.to_string(),
                loc: parser.peek_token().loc,
            }),
        }
    }
}

struct Traversal<'v> {
    visitors: &'v mut [Box<dyn AstVisitor>],
}

impl VisitorMut for Traversal<'_> {
    type Error = EngineError;

    fn visit_node_mut(&mut self, node: &mut Node) -> Result<(), EngineError> {
        for visitor in self.visitors.iter_mut() {
            visitor.on_visit(node)?;
        }
        Ok(())
    }

    fn too_deep(&mut self, node: &Node) -> EngineError {
        EngineError::internal(format!("Max depth reached at {}", node.loc()))
    }
}
