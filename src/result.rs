//! Batch query results.
//!
//! A [`QueryResult`] is built from the compact columnar JSON the server returns
//! for `FORMAT JSONCompact`: column metadata, row-major data and statistics.

use crate::types::TypeRegistry;
use crate::value::{Row, Value};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Execution statistics reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Server-side execution time in seconds
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub bytes_read: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// The `JSONCompact` response body.
#[derive(Debug, Deserialize)]
pub(crate) struct CompactResponse {
    #[serde(default)]
    pub meta: Vec<ColumnMeta>,
    #[serde(default)]
    pub data: Vec<Vec<JsonValue>>,
    pub statistics: Option<Statistics>,
    pub exception: Option<String>,
}

/// The decoded result of a query.
///
/// Immutable; rows can be iterated any number of times.
///
/// # Examples
///
/// ```
/// use clickhttp::types::TypeRegistry;
/// use clickhttp::{QueryResult, Value};
/// use serde_json::json;
///
/// let registry = TypeRegistry::with_defaults();
/// let result = QueryResult::new(
///     vec!["id".into(), "name".into()],
///     vec!["UInt64".into(), "String".into()],
///     vec![vec![json!("1"), json!("alice")], vec![json!("2"), json!("bob")]],
///     &registry,
///     true,
/// )?;
///
/// assert_eq!(result.len(), 2);
/// assert_eq!(result.get(-1).and_then(|r| r.get("name")), Some(&Value::from("bob")));
/// assert_eq!(result.column_values("id")?, vec![&Value::UInt(1), &Value::UInt(2)]);
/// # Ok::<(), clickhttp::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    columns: Arc<[String]>,
    types: Vec<String>,
    rows: Vec<Row>,
    statistics: Option<Statistics>,
    query_id: Option<String>,
}

impl QueryResult {
    /// Builds a result, decoding every value through the codec for its
    /// column's declared type unless `deserialize` is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the column, type and row widths
    /// disagree, and parse or cast errors from the column codecs.
    pub fn new(
        columns: Vec<String>,
        types: Vec<String>,
        data: Vec<Vec<JsonValue>>,
        registry: &TypeRegistry,
        deserialize: bool,
    ) -> Result<Self> {
        if columns.len() != types.len() {
            return Err(Error::InvalidArgument(format!(
                "{} column names but {} column types",
                columns.len(),
                types.len()
            )));
        }

        let codecs = if deserialize {
            Some(
                types
                    .iter()
                    .map(|t| registry.lookup(t))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };

        let columns: Arc<[String]> = columns.into();
        let mut rows = Vec::with_capacity(data.len());
        for (index, raw) in data.into_iter().enumerate() {
            if raw.len() != columns.len() {
                return Err(Error::InvalidArgument(format!(
                    "row {} has {} values, expected {}",
                    index,
                    raw.len(),
                    columns.len()
                )));
            }

            let values = match &codecs {
                Some(codecs) => codecs
                    .iter()
                    .zip(&raw)
                    .map(|(codec, value)| codec.deserialize(value))
                    .collect::<Result<Vec<_>>>()?,
                None => raw.iter().map(Value::from_json).collect(),
            };
            rows.push(Row::new(Arc::clone(&columns), values));
        }

        Ok(Self {
            columns,
            types,
            rows,
            statistics: None,
            query_id: None,
        })
    }

    /// A result with no columns and no rows, as returned for DDL statements.
    pub fn empty() -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            types: Vec::new(),
            rows: Vec::new(),
            statistics: None,
            query_id: None,
        }
    }

    pub(crate) fn from_compact(
        response: CompactResponse,
        registry: &TypeRegistry,
        deserialize: bool,
    ) -> Result<Self> {
        let (columns, types) = response
            .meta
            .into_iter()
            .map(|meta| (meta.name, meta.type_name))
            .unzip();
        let mut result = Self::new(columns, types, response.data, registry, deserialize)?;
        result.statistics = response.statistics;
        Ok(result)
    }

    pub(crate) fn with_query_id(mut self, query_id: String) -> Self {
        self.query_id = Some(query_id);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The declared type of each column, in column order.
    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn statistics(&self) -> Option<&Statistics> {
        self.statistics.as_ref()
    }

    /// The query id the statement ran under.
    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    /// Returns the row at `index`. Negative indexes count from the end.
    pub fn get(&self, index: isize) -> Option<&Row> {
        let index = if index < 0 {
            self.rows.len().checked_sub(index.unsigned_abs())?
        } else {
            index as usize
        };
        self.rows.get(index)
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn last(&self) -> Option<&Row> {
        self.rows.last()
    }

    /// Returns every value of one column, in row order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if there is no such column.
    pub fn column_values(&self, column: &str) -> Result<Vec<&Value>> {
        let index = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown column: {}", column)))?;
        Ok(self.rows.iter().map(|row| &row.values()[index]).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
