//! Extension traits and the registry that holds them.
//!
//! Every tag and filter comes in two halves that never share state: a
//! build-time half (`TagBuilder`, `FilterBuilder`) that parses and rewrites the
//! syntax tree, and a run-time half (`TagRunner`, `FilterRunner`) that the
//! compiled tree calls into while rendering. Both halves are registered under
//! the same name.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use qtl_templates::Node;
use qtl_templates::ParseError;
use qtl_templates::Parser;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::environment::RuntimeEnvironment;
use crate::error::EngineError;
use crate::value::Value;

/// Order in which visitors see each node and run `finish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VisitStage {
    /// Reshapes the tree, e.g. the implicit main builder wrapper.
    Structure,
    /// Injects sanitizer filters into output before later visitors see it.
    Sanitize,
    /// Read-only checks and metadata collection.
    Analyze,
}

/// A compile pass over one template.
///
/// `on_visit` is called for every node of a single pre-order traversal and may
/// replace the node it is given; `finish` runs once afterwards with the root.
pub trait AstVisitor: Send {
    fn stage(&self) -> VisitStage {
        VisitStage::Analyze
    }

    fn on_visit(&mut self, _node: &mut Node) -> Result<(), EngineError> {
        Ok(())
    }

    fn finish(&mut self, _root: &mut Node) -> Result<(), EngineError> {
        Ok(())
    }

    /// Named contribution to the template's compile metadata.
    fn metadata(&self) -> Option<(&'static str, JsonValue)> {
        None
    }
}

/// Name shared by both halves of a tag extension.
#[must_use]
pub fn extension_name(tags: &[&str]) -> String {
    let mut tags = tags.to_vec();
    tags.sort_unstable();
    tags.join("_")
}

pub trait TagBuilder: Send + Sync {
    fn tags(&self) -> &[&'static str];

    fn name(&self) -> String {
        extension_name(self.tags())
    }

    /// Parses the tag. The parser is positioned on the tag name.
    fn parse(&self, tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError>;

    /// Fresh visitors for one compile.
    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        Vec::new()
    }
}

pub trait FilterBuilder: Send + Sync {
    fn filter_name(&self) -> &str;

    fn visitors(&self) -> Vec<Box<dyn AstVisitor>> {
        Vec::new()
    }
}

/// Lazily rendered tag bodies, rendered in order by the runner.
pub struct ContentBlocks<'a> {
    environment: &'a RuntimeEnvironment,
    blocks: &'a [Node],
}

impl<'a> ContentBlocks<'a> {
    pub(crate) fn new(environment: &'a RuntimeEnvironment, blocks: &'a [Node]) -> Self {
        Self {
            environment,
            blocks,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub async fn render(&self, index: usize, context: &mut Context) -> Result<String, EngineError> {
        let block = self
            .blocks
            .get(index)
            .ok_or_else(|| EngineError::internal(format!("No content block at index {index}")))?;
        self.environment.render_node(block, context).await
    }

    /// Renders every block in order and concatenates the output.
    pub async fn render_all(&self, context: &mut Context) -> Result<String, EngineError> {
        let mut output = String::new();
        for index in 0..self.blocks.len() {
            output.push_str(&self.render(index, context).await?);
        }
        Ok(output)
    }
}

#[async_trait]
pub trait TagRunner: Send + Sync {
    fn tags(&self) -> &[&'static str];

    fn name(&self) -> String {
        extension_name(self.tags())
    }

    /// Runs the tag. Returned text is written to the output in place of the
    /// tag.
    async fn run(
        &self,
        context: &mut Context,
        args: Vec<Value>,
        content: ContentBlocks<'_>,
    ) -> Result<Option<String>, EngineError>;
}

#[derive(Clone, Debug, Default)]
pub struct FilterArgs {
    pub positional: Vec<Value>,
    pub keyword: IndexMap<String, Value>,
}

impl FilterArgs {
    /// Positional argument at `index`, falling back to the keyword `name`.
    #[must_use]
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.keyword.get(name))
    }
}

#[async_trait]
pub trait FilterRunner: Send + Sync {
    fn filter_name(&self) -> &str;

    async fn transform(
        &self,
        context: &mut Context,
        value: Value,
        args: FilterArgs,
    ) -> Result<Value, EngineError>;
}

/// All extensions known to an engine, constructed once and handed to both
/// environments.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    tag_builders: Vec<Arc<dyn TagBuilder>>,
    tag_runners: Vec<Arc<dyn TagRunner>>,
    filter_builders: Vec<Arc<dyn FilterBuilder>>,
    filter_runners: Vec<Arc<dyn FilterRunner>>,
}

impl ExtensionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag_builder(&mut self, builder: Arc<dyn TagBuilder>) -> Result<(), EngineError> {
        let name = builder.name();
        if self.tag_builders.iter().any(|existing| existing.name() == name) {
            return Err(duplicate("tag builder", &name));
        }
        self.tag_builders.push(builder);
        Ok(())
    }

    pub fn add_tag_runner(&mut self, runner: Arc<dyn TagRunner>) -> Result<(), EngineError> {
        let name = runner.name();
        if self.tag_runners.iter().any(|existing| existing.name() == name) {
            return Err(duplicate("tag runner", &name));
        }
        self.tag_runners.push(runner);
        Ok(())
    }

    pub fn add_filter_builder(&mut self, builder: Arc<dyn FilterBuilder>) -> Result<(), EngineError> {
        if self
            .filter_builders
            .iter()
            .any(|existing| existing.filter_name() == builder.filter_name())
        {
            return Err(duplicate("filter builder", builder.filter_name()));
        }
        self.filter_builders.push(builder);
        Ok(())
    }

    pub fn add_filter_runner(&mut self, runner: Arc<dyn FilterRunner>) -> Result<(), EngineError> {
        if self
            .filter_runners
            .iter()
            .any(|existing| existing.filter_name() == runner.filter_name())
        {
            return Err(duplicate("filter runner", runner.filter_name()));
        }
        self.filter_runners.push(runner);
        Ok(())
    }

    #[must_use]
    pub fn tag_builders(&self) -> &[Arc<dyn TagBuilder>] {
        &self.tag_builders
    }

    #[must_use]
    pub fn tag_runners(&self) -> &[Arc<dyn TagRunner>] {
        &self.tag_runners
    }

    #[must_use]
    pub fn filter_builders(&self) -> &[Arc<dyn FilterBuilder>] {
        &self.filter_builders
    }

    #[must_use]
    pub fn filter_runners(&self) -> &[Arc<dyn FilterRunner>] {
        &self.filter_runners
    }
}

fn duplicate(kind: &str, name: &str) -> EngineError {
    EngineError::Configuration(format!("A {kind} named `{name}` is already registered"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static [&'static str]);

    impl TagBuilder for Noop {
        fn tags(&self) -> &[&'static str] {
            self.0
        }

        fn parse(&self, _tag: &str, parser: &mut Parser<'_>) -> Result<Node, ParseError> {
            Err(ParseError::syntax("unused", parser.peek_token().loc))
        }
    }

    #[test]
    fn test_extension_name_sorts_tags() {
        assert_eq!(extension_name(&["endtest", "test"]), "endtest_test");
        assert_eq!(Noop(&["req"]).name(), "req");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.add_tag_builder(Arc::new(Noop(&["req"]))).unwrap();
        let err = registry.add_tag_builder(Arc::new(Noop(&["req"]))).unwrap_err();
        assert_eq!(err.to_string(), "A tag builder named `req` is already registered");
        assert_eq!(registry.tag_builders().len(), 1);
    }
}
