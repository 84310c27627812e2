use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde_json::Value as JsonValue;

use crate::error::QueryError;

/// Turns a parameter index and value into a placeholder identifier.
#[async_trait]
pub trait Prepare: Send + Sync {
    async fn prepare(&self, parameter_index: usize, value: &JsonValue)
        -> Result<String, QueryError>;
}

#[async_trait]
impl<F> Prepare for F
where
    F: Fn(usize, &JsonValue) -> String + Send + Sync,
{
    async fn prepare(
        &self,
        parameter_index: usize,
        value: &JsonValue,
    ) -> Result<String, QueryError> {
        Ok(self(parameter_index, value))
    }
}

#[derive(Default)]
struct Bindings {
    cursor: usize,
    id_to_value: IndexMap<String, JsonValue>,
    value_to_id: FxHashMap<String, String>,
}

/// Allocates placeholder identifiers for values bound into a statement.
///
/// A parameterizer and every parameterizer forked from it form a lineage.
/// Indices handed to `prepare` are unique within a lineage, so a fork never
/// reuses a number its parent issued and `reset` never renumbers a value.
pub struct Parameterizer {
    start_index: usize,
    bindings: Mutex<Bindings>,
    issued: Arc<Mutex<FxHashSet<usize>>>,
    prepare: Arc<dyn Prepare>,
}

impl Parameterizer {
    pub const FIRST_INDEX: usize = 1;

    pub fn new(prepare: Arc<dyn Prepare>) -> Self {
        Self::with_lineage(prepare, Self::FIRST_INDEX, Arc::default())
    }

    fn with_lineage(
        prepare: Arc<dyn Prepare>,
        start_index: usize,
        issued: Arc<Mutex<FxHashSet<usize>>>,
    ) -> Self {
        Self {
            start_index,
            bindings: Mutex::new(Bindings {
                cursor: start_index,
                ..Bindings::default()
            }),
            issued,
            prepare,
        }
    }

    /// Returns the identifier bound to `value`, preparing a new one on first
    /// sight. Values are compared structurally.
    pub async fn generate_identifier(&self, value: &JsonValue) -> Result<String, QueryError> {
        let key = canonical_key(value);

        let index = {
            let mut bindings = self.lock_bindings();
            if let Some(id) = bindings.value_to_id.get(&key) {
                return Ok(id.clone());
            }
            let index = self.claim_index(bindings.cursor);
            bindings.cursor = index + 1;
            index
        };

        let id = self.prepare.prepare(index, value).await?;
        tracing::trace!(index, %id, "bound parameter");

        let mut bindings = self.lock_bindings();
        if let Some(existing) = bindings.value_to_id.get(&key) {
            return Ok(existing.clone());
        }
        bindings.id_to_value.insert(id.clone(), value.clone());
        bindings.value_to_id.insert(key, id.clone());
        Ok(id)
    }

    /// Identifier to value pairs in the order they were first bound.
    #[must_use]
    pub fn binding(&self) -> IndexMap<String, JsonValue> {
        self.lock_bindings().id_to_value.clone()
    }

    /// Forks a parameterizer with an empty binding that continues this
    /// lineage's numbering from the current position.
    #[must_use]
    pub fn fork(&self) -> Self {
        let cursor = self.lock_bindings().cursor;
        let start_index = self.first_unissued(cursor);
        Self::with_lineage(
            Arc::clone(&self.prepare),
            start_index,
            Arc::clone(&self.issued),
        )
    }

    /// Rewinds the counter to the start index. Bound values keep their
    /// identifiers.
    pub fn reset(&self) {
        self.lock_bindings().cursor = self.start_index;
    }

    #[must_use]
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    fn claim_index(&self, from: usize) -> usize {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index = from;
        while issued.contains(&index) {
            index += 1;
        }
        issued.insert(index);
        index
    }

    fn first_unissued(&self, from: usize) -> usize {
        let issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index = from;
        while issued.contains(&index) {
            index += 1;
        }
        index
    }

    fn lock_bindings(&self) -> std::sync::MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Parameterizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = self.lock_bindings();
        f.debug_struct("Parameterizer")
            .field("start_index", &self.start_index)
            .field("cursor", &bindings.cursor)
            .field("binding", &bindings.id_to_value)
            .finish_non_exhaustive()
    }
}

/// `serde_json` maps are ordered by key, so equal values serialize equally.
fn canonical_key(value: &JsonValue) -> String {
    value.to_string()
}
