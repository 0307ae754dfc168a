//! Engine type mappings.
//!
//! Converts driver rows into the JSON [`Row`] maps carried by
//! [`QueryResult`](crate::models::QueryResult).
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Engine-specific decoders handle the actual value extraction
//!
//! SQLite columns are typed per value rather than per column, so its decoder
//! falls back to the runtime storage class when the declared type says
//! nothing useful. SQL Server rows arrive as `tiberius::ColumnData` and are
//! matched directly.

use crate::models::{DriverKind, Row};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Text,
    Binary,
    Json,
    Uuid,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, driver: DriverKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity is stored as integer or real
        if driver == DriverKind::Sqlite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower == "time"
        || lower == "timetz"
    {
        return TypeCategory::Temporal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" || lower == "bit" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Encode binary data as JSON: UTF-8 text when valid, base64 otherwise.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    match std::str::from_utf8(bytes) {
        Ok(s) => JsonValue::String(s.to_string()),
        Err(_) => JsonValue::String(STANDARD.encode(bytes)),
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn text_value(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting driver rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DriverKind::MySql);
                let value = mysql::decode_column(self, idx, type_name, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DriverKind::Postgres);
                let value = postgres::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let declared = col.type_info().name();
                let category = categorize_type(declared, DriverKind::Sqlite);
                let value = sqlite::decode_column(self, idx, declared, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for tiberius::Row {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name().to_string(), mssql::decode_column(self, idx)))
            .collect()
    }
}

// =============================================================================
// Engine-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_temporal(row: &MySqlRow, idx: usize) -> JsonValue {
        use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return JsonValue::String(v.to_rfc3339());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => text_value(v, type_name),
            _ => JsonValue::Null,
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_temporal(row: &PgRow, idx: usize) -> JsonValue {
        use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return JsonValue::String(v.to_rfc3339());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        declared: &str,
        category: TypeCategory,
    ) -> JsonValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_uppercase(),
            Err(_) => return JsonValue::Null,
        };

        match (category, storage.as_str()) {
            (TypeCategory::Boolean, "INTEGER") => decode_boolean(row, idx),
            (_, "INTEGER") => decode_integer(row, idx),
            (_, "REAL") => decode_float(row, idx),
            (_, "BLOB") => decode_binary_col(row, idx),
            _ => decode_text(row, idx, declared),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_boolean(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => float_value(v),
            _ => JsonValue::Null,
        }
    }

    fn decode_binary_col(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &SqliteRow, idx: usize, declared: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => text_value(v, declared),
            _ => JsonValue::Null,
        }
    }
}

mod mssql {
    use super::*;
    use tiberius::ColumnData;

    pub fn decode_column(row: &tiberius::Row, idx: usize) -> JsonValue {
        let Some(data) = row.cells().nth(idx).map(|(_, data)| data) else {
            return JsonValue::Null;
        };
        match data {
            ColumnData::U8(v) => v.map(|v| JsonValue::Number(v.into())).unwrap_or_default(),
            ColumnData::I16(v) => v.map(|v| JsonValue::Number(v.into())).unwrap_or_default(),
            ColumnData::I32(v) => v.map(|v| JsonValue::Number(v.into())).unwrap_or_default(),
            ColumnData::I64(v) => v.map(|v| JsonValue::Number(v.into())).unwrap_or_default(),
            ColumnData::F32(v) => v.map(|v| float_value(v as f64)).unwrap_or_default(),
            ColumnData::F64(v) => v.map(float_value).unwrap_or_default(),
            ColumnData::Bit(v) => v.map(JsonValue::Bool).unwrap_or_default(),
            ColumnData::String(v) => v
                .as_ref()
                .map(|s| JsonValue::String(s.to_string()))
                .unwrap_or_default(),
            ColumnData::Guid(v) => v
                .map(|g| JsonValue::String(g.to_string()))
                .unwrap_or_default(),
            ColumnData::Binary(v) => v
                .as_ref()
                .map(|b| decode_binary_value(b))
                .unwrap_or_default(),
            ColumnData::Numeric(v) => v
                .map(|n| JsonValue::String(n.to_string()))
                .unwrap_or_default(),
            ColumnData::Xml(v) => v
                .as_ref()
                .map(|x| JsonValue::String(x.clone().into_owned().into_string()))
                .unwrap_or_default(),
            _ => decode_temporal(row, idx),
        }
    }

    fn decode_temporal(row: &tiberius::Row, idx: usize) -> JsonValue {
        use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

        if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<DateTime<Utc>, _>(idx) {
            return JsonValue::String(v.to_rfc3339());
        }
        if let Ok(Some(v)) = row.try_get::<NaiveDate, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<NaiveTime, _>(idx) {
            return JsonValue::String(v.to_string());
        }
        JsonValue::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DriverKind::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DriverKind::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DriverKind::Postgres),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DriverKind::MySql),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", DriverKind::Postgres),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("numeric", DriverKind::Sqlite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMP", DriverKind::MySql),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DriverKind::Postgres),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("DATE", DriverKind::Postgres),
            TypeCategory::Temporal
        );
    }

    #[test]
    fn test_categorize_type_misc() {
        assert_eq!(
            categorize_type("jsonb", DriverKind::Postgres),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("BOOLEAN", DriverKind::Sqlite),
            TypeCategory::Boolean
        );
        assert_eq!(
            categorize_type("VARCHAR", DriverKind::MySql),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("NULL", DriverKind::Sqlite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(
            decode_binary_value(b"hello world"),
            JsonValue::String("hello world".to_string())
        );
        let bytes: &[u8] = &[0xFF, 0xFE, 0x00, 0x01];
        assert_eq!(
            decode_binary_value(bytes),
            JsonValue::String("//4AAQ==".to_string())
        );
    }

    #[test]
    fn test_text_value_parses_json_columns() {
        let value = text_value(r#"{"a":1}"#.to_string(), "JSON");
        assert_eq!(value["a"], 1);
        let value = text_value("plain".to_string(), "TEXT");
        assert_eq!(value, JsonValue::String("plain".to_string()));
    }
}
