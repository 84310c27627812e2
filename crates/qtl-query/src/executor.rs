use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::builder::QueryBuilder;
use crate::data_source::DataSource;
use crate::data_source::Headers;
use crate::data_source::RequestParameter;
use crate::error::QueryError;
use crate::parameterizer::Parameterizer;
use crate::parameterizer::Prepare;

/// Routes queries to the data source registered for each profile.
#[derive(Clone, Default)]
pub struct QueryExecutor {
    sources: IndexMap<String, Arc<dyn DataSource>>,
}

impl QueryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile_name: impl Into<String>, source: Arc<dyn DataSource>) {
        let profile_name = profile_name.into();
        tracing::debug!(profile = %profile_name, "registered data source");
        self.sources.insert(profile_name, source);
    }

    #[must_use]
    pub fn with_source(mut self, profile_name: impl Into<String>, source: Arc<dyn DataSource>) -> Self {
        self.register(profile_name, source);
        self
    }

    pub fn data_source(&self, profile_name: &str) -> Result<&Arc<dyn DataSource>, QueryError> {
        self.sources
            .get(profile_name)
            .ok_or_else(|| QueryError::UnknownProfile(profile_name.to_string()))
    }

    /// Asks the profile's data source for the placeholder of a parameter.
    pub async fn prepare(
        &self,
        profile_name: &str,
        parameter_index: usize,
        value: JsonValue,
    ) -> Result<String, QueryError> {
        let source = self.data_source(profile_name)?;
        Ok(source
            .prepare(RequestParameter {
                parameter_index,
                value,
                profile_name: profile_name.to_string(),
            })
            .await?)
    }

    /// A fresh parameterizer whose placeholders come from the profile's data
    /// source.
    pub fn parameterizer(&self, profile_name: &str) -> Result<Parameterizer, QueryError> {
        let source = Arc::clone(self.data_source(profile_name)?);
        Ok(Parameterizer::new(Arc::new(ProfilePrepare {
            source,
            profile_name: profile_name.to_string(),
        })))
    }

    pub fn create_builder(
        &self,
        profile_name: &str,
        statement: impl Into<String>,
        parameterizer: Arc<Parameterizer>,
        headers: Headers,
    ) -> Result<Arc<QueryBuilder>, QueryError> {
        let source = Arc::clone(self.data_source(profile_name)?);
        let builder = QueryBuilder::new(statement, profile_name, source, parameterizer);
        builder.set_headers(headers);
        Ok(Arc::new(builder))
    }
}

struct ProfilePrepare {
    source: Arc<dyn DataSource>,
    profile_name: String,
}

#[async_trait]
impl Prepare for ProfilePrepare {
    async fn prepare(
        &self,
        parameter_index: usize,
        value: &JsonValue,
    ) -> Result<String, QueryError> {
        Ok(self
            .source
            .prepare(RequestParameter {
                parameter_index,
                value: value.clone(),
                profile_name: self.profile_name.clone(),
            })
            .await?)
    }
}
