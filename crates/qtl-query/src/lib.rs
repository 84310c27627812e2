//! Parameter binding, query composition and data source dispatch.

mod builder;
mod data_source;
mod error;
mod executor;
mod parameterizer;

pub use builder::QueryBuilder;
pub use data_source::BoundOperations;
pub use data_source::DataColumn;
pub use data_source::DataResult;
pub use data_source::DataSource;
pub use data_source::Direction;
pub use data_source::ExecuteOptions;
pub use data_source::Headers;
pub use data_source::Operations;
pub use data_source::OrderBy;
pub use data_source::Pagination;
pub use data_source::RequestParameter;
pub use data_source::Row;
pub use error::QueryError;
pub use executor::QueryExecutor;
pub use parameterizer::Parameterizer;
pub use parameterizer::Prepare;
