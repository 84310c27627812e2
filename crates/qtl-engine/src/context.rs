use std::sync::Arc;

use indexmap::IndexMap;
use qtl_query::Headers;
use qtl_query::Parameterizer;

use crate::value::Value;

/// Request-scoped facts visible to tag runners.
#[derive(Clone, Debug, Default)]
pub struct ExecutionMetadata {
    pub profile_name: Option<String>,
    pub headers: Headers,
}

/// Variable scope of one render.
///
/// Lookups read the innermost frame first, then outer frames, then the
/// context variables that extensions and the engine set. Assignments at the
/// top level are exported to the caller.
#[derive(Debug)]
pub struct Context {
    variables: IndexMap<String, Value>,
    frames: Vec<IndexMap<String, Value>>,
    exports: IndexMap<String, Value>,
    parameterizer: Option<Arc<Parameterizer>>,
    metadata: ExecutionMetadata,
}

impl Context {
    #[must_use]
    pub fn new(metadata: ExecutionMetadata) -> Self {
        Self {
            variables: IndexMap::new(),
            frames: vec![IndexMap::new()],
            exports: IndexMap::new(),
            parameterizer: None,
            metadata,
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.variables.get(name))
    }

    /// Sets a context-level variable, visible from every frame.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Assigns in the innermost frame, exporting top-level assignments.
    pub fn assign(&mut self, name: &str, value: Value) {
        if self.frames.len() == 1 {
            self.exports.insert(name.to_string(), value.clone());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    pub fn export(&mut self, name: impl Into<String>, value: Value) {
        self.exports.insert(name.into(), value);
    }

    #[must_use]
    pub fn exports(&self) -> &IndexMap<String, Value> {
        &self.exports
    }

    pub fn push_frame(&mut self) {
        self.frames.push(IndexMap::new());
    }

    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// The parameterizer that sanitized values are bound through.
    #[must_use]
    pub fn parameterizer(&self) -> Option<&Arc<Parameterizer>> {
        self.parameterizer.as_ref()
    }

    /// Installs `parameterizer` and returns the previous one so the caller
    /// can restore it.
    pub fn replace_parameterizer(
        &mut self,
        parameterizer: Option<Arc<Parameterizer>>,
    ) -> Option<Arc<Parameterizer>> {
        std::mem::replace(&mut self.parameterizer, parameterizer)
    }

    #[must_use]
    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }
}
