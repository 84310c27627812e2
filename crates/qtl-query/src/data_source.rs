use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as JsonValue;

/// Forwarded request headers.
pub type Headers = BTreeMap<String, String>;

/// One result row keyed by column name.
pub type Row = Map<String, JsonValue>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("asc") {
            Ok(Direction::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Ok(Direction::Desc)
        } else {
            Err(format!("Unknown order direction `{s}`, expected ASC or DESC"))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// Clause operations accumulated on a builder. Limit and offset keep their
/// raw values until the builder executes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Operations {
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<JsonValue>,
    pub offset: Option<JsonValue>,
}

/// Operations as sent to a data source: limit and offset are replaced by
/// parameter identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoundOperations {
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecuteOptions {
    pub statement: String,
    pub operations: BoundOperations,
    pub bind_params: IndexMap<String, JsonValue>,
    pub headers: Headers,
    pub profile_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestParameter {
    pub parameter_index: usize,
    pub value: JsonValue,
    pub profile_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl DataColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Columns plus a stream of rows returned by [`DataSource::execute`].
pub struct DataResult {
    pub columns: Vec<DataColumn>,
    pub data: BoxStream<'static, anyhow::Result<Row>>,
}

impl DataResult {
    #[must_use]
    pub fn from_rows(columns: Vec<DataColumn>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            data: Box::pin(stream::iter(rows.into_iter().map(Ok))),
        }
    }

    /// Drains the row stream, stopping at the first failed row.
    pub async fn collect(self) -> anyhow::Result<Vec<Row>> {
        self.data.try_collect().await
    }
}

impl fmt::Debug for DataResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataResult")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// A driver able to run statements for one or more profiles.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn execute(&self, options: ExecuteOptions) -> anyhow::Result<DataResult>;

    /// Returns the driver-specific placeholder for a bound parameter, such as
    /// `$1` or `@p1`.
    async fn prepare(&self, parameter: RequestParameter) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_direction_parsing_ignores_case() {
        assert_eq!("desc".parse::<Direction>(), Ok(Direction::Desc));
        assert_eq!("ASC".parse::<Direction>(), Ok(Direction::Asc));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_direction_serializes_upper_case() {
        let order = OrderBy {
            column: "x".to_string(),
            direction: Direction::Desc,
        };
        assert_eq!(
            serde_json::to_value(order).unwrap(),
            json!({"column": "x", "direction": "DESC"})
        );
    }

    #[tokio::test]
    async fn test_data_result_collects_rows() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        let result = DataResult::from_rows(vec![DataColumn::new("id", "integer")], vec![row.clone()]);
        assert_eq!(result.columns[0].name, "id");
        assert_eq!(result.collect().await.unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn test_data_result_stops_at_failed_row() {
        let result = DataResult {
            columns: Vec::new(),
            data: Box::pin(stream::iter(vec![
                Ok(Row::new()),
                Err(anyhow::anyhow!("connection reset")),
            ])),
        };
        let err = result.collect().await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }
}
