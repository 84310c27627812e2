use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::instrument;

use crate::data_source::BoundOperations;
use crate::data_source::DataResult;
use crate::data_source::DataSource;
use crate::data_source::Direction;
use crate::data_source::ExecuteOptions;
use crate::data_source::Headers;
use crate::data_source::Operations;
use crate::data_source::OrderBy;
use crate::data_source::Pagination;
use crate::error::QueryError;
use crate::parameterizer::Parameterizer;

#[derive(Default)]
struct BuilderState {
    operations: Operations,
    headers: Headers,
}

/// A rendered statement plus the clause operations composed on it.
///
/// Builders are shared as `Arc<QueryBuilder>` between the render context and
/// the engine, so composition methods take `&self`.
pub struct QueryBuilder {
    statement: String,
    profile_name: String,
    data_source: Arc<dyn DataSource>,
    parameterizer: Arc<Parameterizer>,
    /// Bindings of the builder this one was forked from; the statement text
    /// still refers to them.
    inherited: IndexMap<String, JsonValue>,
    state: Mutex<BuilderState>,
}

impl QueryBuilder {
    pub fn new(
        statement: impl Into<String>,
        profile_name: impl Into<String>,
        data_source: Arc<dyn DataSource>,
        parameterizer: Arc<Parameterizer>,
    ) -> Self {
        Self {
            statement: statement.into(),
            profile_name: profile_name.into(),
            data_source,
            parameterizer,
            inherited: IndexMap::new(),
            state: Mutex::new(BuilderState::default()),
        }
    }

    #[must_use]
    pub fn statement(&self) -> &str {
        &self.statement
    }

    #[must_use]
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    #[must_use]
    pub fn parameterizer(&self) -> &Arc<Parameterizer> {
        &self.parameterizer
    }

    #[must_use]
    pub fn operations(&self) -> Operations {
        self.lock_state().operations.clone()
    }

    #[must_use]
    pub fn headers(&self) -> Headers {
        self.lock_state().headers.clone()
    }

    pub fn set_headers(&self, headers: Headers) -> &Self {
        self.lock_state().headers = headers;
        self
    }

    /// Appends grouping columns after any previously added ones.
    pub fn group_by<I, S>(&self, columns: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_state()
            .operations
            .group_by
            .extend(columns.into_iter().map(Into::into));
        self
    }

    /// Appends a sort key.
    pub fn order_by(&self, column: impl Into<String>, direction: Direction) -> &Self {
        self.lock_state().operations.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(&self, size: impl Into<JsonValue>) -> &Self {
        self.lock_state().operations.limit = Some(size.into());
        self
    }

    pub fn offset(&self, offset: impl Into<JsonValue>) -> &Self {
        self.lock_state().operations.offset = Some(offset.into());
        self
    }

    pub fn take(&self, size: impl Into<JsonValue>, offset: impl Into<JsonValue>) -> &Self {
        let mut state = self.lock_state();
        state.operations.limit = Some(size.into());
        state.operations.offset = Some(offset.into());
        drop(state);
        self
    }

    /// Applies request pagination; unset fields leave the current values.
    pub fn paginate(&self, pagination: Pagination) -> &Self {
        let mut state = self.lock_state();
        if let Some(limit) = pagination.limit {
            state.operations.limit = Some(limit.into());
        }
        if let Some(offset) = pagination.offset {
            state.operations.offset = Some(offset.into());
        }
        drop(state);
        self
    }

    /// Copies the statement and operations onto a new builder with a forked
    /// parameterizer. Later changes to either builder do not affect the other.
    #[must_use]
    pub fn fork(&self) -> Self {
        let state = self.lock_state();
        let mut inherited = self.inherited.clone();
        inherited.extend(self.parameterizer.binding());

        Self {
            statement: self.statement.clone(),
            profile_name: self.profile_name.clone(),
            data_source: Arc::clone(&self.data_source),
            parameterizer: Arc::new(self.parameterizer.fork()),
            inherited,
            state: Mutex::new(BuilderState {
                operations: state.operations.clone(),
                headers: state.headers.clone(),
            }),
        }
    }

    /// Executes the statement on the bound data source.
    ///
    /// Offset and limit are bound as parameters rather than inlined. The
    /// parameterizer is reset afterwards so repeated calls produce the same
    /// numbering.
    #[instrument(skip(self), fields(profile = %self.profile_name))]
    pub async fn value(&self) -> Result<DataResult, QueryError> {
        let result = self.execute().await;
        self.parameterizer.reset();
        if let Err(err) = &result {
            tracing::debug!(error = %err, "data source execution failed");
        }
        result
    }

    async fn execute(&self) -> Result<DataResult, QueryError> {
        let (operations, headers) = {
            let state = self.lock_state();
            (state.operations.clone(), state.headers.clone())
        };

        let offset = match &operations.offset {
            Some(offset) => Some(self.parameterizer.generate_identifier(offset).await?),
            None => None,
        };
        let limit = match &operations.limit {
            Some(limit) => Some(self.parameterizer.generate_identifier(limit).await?),
            None => None,
        };

        let mut bind_params = self.inherited.clone();
        bind_params.extend(self.parameterizer.binding());

        let options = ExecuteOptions {
            statement: self.statement.clone(),
            operations: BoundOperations {
                group_by: operations.group_by,
                order_by: operations.order_by,
                limit,
                offset,
            },
            bind_params,
            headers,
            profile_name: self.profile_name.clone(),
        };

        Ok(self.data_source.execute(options).await?)
    }

    fn lock_state(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("statement", &self.statement)
            .field("profile_name", &self.profile_name)
            .field("operations", &self.lock_state().operations)
            .finish_non_exhaustive()
    }
}
