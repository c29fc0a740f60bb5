//! Helpers for nullable libSQL columns and parameters

use crate::error::{Error, Result};
use libsql::{Row, Value};

/// Text parameter that binds as `NULL` when absent.
pub fn nullable_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

/// Integer parameter that binds as `NULL` when absent.
pub fn nullable_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Read a nullable text column.
pub fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "Expected text in column {idx}, found {other:?}"
        ))),
    }
}

/// Read a nullable integer column.
pub fn optional_integer(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "Expected integer in column {idx}, found {other:?}"
        ))),
    }
}

/// Read a non-negative integer column as `u64`, clamping negatives to zero.
pub fn unsigned(row: &Row, idx: i32) -> Result<u64> {
    let value: i64 = row.get(idx)?;
    Ok(u64::try_from(value).unwrap_or(0))
}

/// Convert a byte count or limit to the `i64` SQLite stores.
pub fn to_sql_integer<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}
