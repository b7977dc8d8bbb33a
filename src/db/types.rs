//! Row decoding.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the declared column type
//! 2. A decoder per category extracts the value as JSON
//!
//! Entities are rebuilt from the resulting map with serde.

use crate::db::Row as JsonRow;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Json,
}

/// Classify a SQLite type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower.contains("real")
        || lower.contains("float")
        || lower.contains("double")
        || lower.contains("numeric")
        || lower.contains("decimal")
    {
        return TypeCategory::Float;
    }
    if lower.contains("json") {
        return TypeCategory::Json;
    }
    if lower.contains("blob") {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = match column_category(self, idx, col.type_info().name()) {
                    Some(category) => decode_column(self, idx, category),
                    None => JsonValue::Null,
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

/// Category from the declared type, or from the stored value for expressions.
///
/// Returns `None` for SQL NULL.
fn column_category(row: &SqliteRow, idx: usize, declared: &str) -> Option<TypeCategory> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.is_null() {
        return None;
    }
    if declared.eq_ignore_ascii_case("null") {
        return Some(categorize_type(raw.type_info().name()));
    }
    Some(categorize_type(declared))
}

fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Text => decode_text(row, idx),
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
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()));
    }
    JsonValue::Null
}

fn decode_binary(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| JsonValue::Array(v.into_iter().map(|b| JsonValue::Number(b.into())).collect()))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
        _ => JsonValue::Null,
    }
}

fn decode_text(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<String>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::String)
        .unwrap_or(JsonValue::Null)
}
