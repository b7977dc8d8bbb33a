//! Parameter binding utilities for database queries.

use crate::models::SqlValue;
use sqlx::Sqlite;
use sqlx::sqlite::SqliteArguments;

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}
