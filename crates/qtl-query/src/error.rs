use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No data source is registered for profile `{0}`")]
    UnknownProfile(String),
    /// Failure raised by a data source, propagated unchanged.
    #[error(transparent)]
    DataSource(#[from] anyhow::Error),
}
