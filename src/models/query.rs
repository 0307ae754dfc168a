//! Query-related data models.
//!
//! This module defines query parameters, the adapter-level [`RawResult`]
//! and the normalized [`QueryResult`] every caller receives.

use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One decoded row: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Result shape produced by an adapter before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// A row-returning statement.
    Rows(Vec<Row>),
    /// A statement that only reports affected rows.
    Affected {
        rows_affected: u64,
        last_insert_id: Option<i64>,
    },
    /// Several results from one batch, in execution order.
    Batch(Vec<RawResult>),
}

impl RawResult {
    /// An affected-rows result without an insert id.
    pub fn affected(rows_affected: u64) -> Self {
        Self::Affected {
            rows_affected,
            last_insert_id: None,
        }
    }
}

/// Normalized query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Number of rows returned, or affected when the statement returned none.
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
}

impl QueryResult {
    /// Normalize whatever shape the adapter produced.
    ///
    /// Batches are drained in order: rows concatenate, affected counts add up
    /// and the last reported insert id wins.
    pub fn from_raw(raw: RawResult) -> Self {
        let mut result = QueryResult::default();
        let mut affected = 0u64;
        result.absorb(raw, &mut affected);
        if result.rows.is_empty() {
            result.row_count = affected;
        } else {
            result.row_count = result.rows.len() as u64;
        }
        result
    }

    fn absorb(&mut self, raw: RawResult, affected: &mut u64) {
        match raw {
            RawResult::Rows(rows) => self.rows.extend(rows),
            RawResult::Affected {
                rows_affected,
                last_insert_id,
            } => {
                *affected += rows_affected;
                if last_insert_id.is_some() {
                    self.insert_id = last_insert_id;
                }
            }
            RawResult::Batch(parts) => {
                for part in parts {
                    self.absorb(part, affected);
                }
            }
        }
    }

    /// True when the statement produced no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Deserialize every row into `T`.
    pub fn rows_as<T: DeserializeOwned>(&self) -> DbResult<Vec<T>> {
        self.rows
            .iter()
            .map(|row| {
                serde_json::from_value(JsonValue::Object(row.clone()))
                    .map_err(|e| DbError::internal(format!("Failed to map row: {}", e)))
            })
            .collect()
    }
}

/// Read a column as a string, accepting numbers as well.
pub fn column_string(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read a column as an integer, accepting numeric strings as well.
pub fn column_i64(row: &Row, column: &str) -> Option<i64> {
    match row.get(column)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_rows_count_as_row_count() {
        let raw = RawResult::Rows(vec![row(json!({"a": 1})), row(json!({"a": 2}))]);
        let result = QueryResult::from_raw(raw);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.insert_id, None);
    }

    #[test]
    fn test_affected_result() {
        let raw = RawResult::Affected {
            rows_affected: 3,
            last_insert_id: Some(42),
        };
        let result = QueryResult::from_raw(raw);
        assert!(result.is_empty());
        assert_eq!(result.row_count, 3);
        assert_eq!(result.insert_id, Some(42));
    }

    #[test]
    fn test_batch_is_drained() {
        let raw = RawResult::Batch(vec![
            RawResult::Affected {
                rows_affected: 1,
                last_insert_id: Some(7),
            },
            RawResult::Batch(vec![RawResult::Rows(vec![row(json!({"id": 7}))])]),
            RawResult::affected(2),
        ]);
        let result = QueryResult::from_raw(raw);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.insert_id, Some(7));
    }

    #[test]
    fn test_rows_as() {
        #[derive(Deserialize)]
        struct Todo {
            id: i64,
            title: String,
        }
        let result = QueryResult::from_raw(RawResult::Rows(vec![row(
            json!({"id": 1, "title": "write tests"}),
        )]));
        let todos: Vec<Todo> = result.rows_as().unwrap();
        assert_eq!(todos[0].id, 1);
        assert_eq!(todos[0].title, "write tests");
    }

    #[test]
    fn test_column_helpers() {
        let r = row(json!({"port": "3306", "id": 5, "pass": null}));
        assert_eq!(column_i64(&r, "port"), Some(3306));
        assert_eq!(column_string(&r, "id"), Some("5".to_string()));
        assert_eq!(column_string(&r, "pass"), None);
        assert_eq!(column_string(&r, "missing"), None);
    }

    #[test]
    fn test_param_conversions() {
        assert_eq!(QueryParam::from("x"), QueryParam::String("x".to_string()));
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(3i64)), QueryParam::Int(3));
    }
}
