use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use std::str::FromStr;

use crate::models::ParseEnumError;

/// Filter empty strings to None (the DB stores '' instead of NULL)
pub fn none_if_empty(opt: Option<String>) -> Option<String> {
    opt.filter(|s| !s.is_empty())
}

/// Decode a JSON text column into a typed value
pub fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed JSON in column {}", column))
}

/// Encode a typed value for a JSON text column
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

/// Decode a closed enum stored as text
pub fn enum_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.try_get(column)?;
    Ok(raw.parse::<T>()?)
}

/// True when the error chain holds a UNIQUE constraint violation
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}
