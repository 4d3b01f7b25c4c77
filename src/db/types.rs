//! Row decoding.
//!
//! Rows are turned into JSON maps so they can be returned as-is from raw
//! queries or fed to serde to rebuild an entity. Each column is classified by
//! its reported type name, then read with the matching Rust type. NULL is the
//! only thing that becomes `null`: a value of a type with no dedicated reader
//! comes back in its text form, and one that cannot be read at all fails the
//! row with a decode error naming the column.

use crate::db::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::JsonRow;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use uuid::Uuid;

/// How a column's values are read out of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    /// Arbitrary-precision; kept as its exact text.
    Numeric,
    Boolean,
    Text,
    Bytes,
    Json,
    Uuid,
    Timestamp,
    Date,
    Other,
}

impl ColumnKind {
    pub fn classify(type_name: &str, dialect: Dialect) -> Self {
        match type_name.to_ascii_uppercase().as_str() {
            "INT2" | "INT4" | "INT8" | "SMALLINT" | "INT" | "INTEGER" | "BIGINT" => Self::Integer,
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => Self::Float,
            // SQLite has no exact decimal storage.
            "NUMERIC" | "DECIMAL" if dialect == Dialect::Sqlite => Self::Float,
            "NUMERIC" | "DECIMAL" => Self::Numeric,
            "BOOL" | "BOOLEAN" => Self::Boolean,
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => Self::Text,
            "BYTEA" | "BLOB" => Self::Bytes,
            "JSON" | "JSONB" => Self::Json,
            "UUID" => Self::Uuid,
            "TIMESTAMPTZ" | "TIMESTAMP" | "DATETIME" => Self::Timestamp,
            "DATE" => Self::Date,
            _ => Self::Other,
        }
    }
}

/// NUMERIC read through its text form, so no precision is lost.
#[derive(Debug)]
struct NumericText(String);

impl Type<sqlx::Postgres> for NumericText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("NUMERIC")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for NumericText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let text = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(NumericText(text.to_string()))
    }
}

/// Binary column data as a base64 string.
pub fn encode_bytes(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Floats JSON cannot represent (NaN, infinities) are kept as text.
fn float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

pub trait RowToJson {
    fn to_json_map(&self) -> DbResult<JsonRow>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> DbResult<JsonRow> {
        collect_columns(self, Dialect::Postgres, decode_postgres)
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> DbResult<JsonRow> {
        collect_columns(self, Dialect::Sqlite, decode_sqlite)
    }
}

type Decoder<R> = fn(&R, usize, ColumnKind, &str) -> Result<JsonValue, sqlx::Error>;

fn collect_columns<R: Row>(row: &R, dialect: Dialect, decode: Decoder<R>) -> DbResult<JsonRow> {
    row.columns()
        .iter()
        .map(|column| {
            let type_name = column.type_info().name();
            let kind = ColumnKind::classify(type_name, dialect);
            let value = decode(row, column.ordinal(), kind, type_name).map_err(|e| {
                DbError::decode(format!("column '{}' ({}): {}", column.name(), type_name, e))
            })?;
            Ok((column.name().to_string(), value))
        })
        .collect()
}

fn decode_postgres(
    row: &PgRow,
    idx: usize,
    kind: ColumnKind,
    type_name: &str,
) -> Result<JsonValue, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(JsonValue::Null);
    }
    let value = match kind {
        ColumnKind::Integer => row
            .try_get::<i64, _>(idx)
            .or_else(|_| row.try_get::<i32, _>(idx).map(i64::from))
            .or_else(|_| row.try_get::<i16, _>(idx).map(i64::from))
            .map(JsonValue::from)?,
        ColumnKind::Float => row
            .try_get::<f64, _>(idx)
            .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
            .map(float)?,
        ColumnKind::Numeric => JsonValue::String(row.try_get::<NumericText, _>(idx)?.0),
        ColumnKind::Boolean => JsonValue::Bool(row.try_get(idx)?),
        ColumnKind::Bytes => encode_bytes(&row.try_get::<Vec<u8>, _>(idx)?),
        ColumnKind::Json => row.try_get::<JsonValue, _>(idx)?,
        ColumnKind::Uuid => JsonValue::String(row.try_get::<Uuid, _>(idx)?.to_string()),
        ColumnKind::Timestamp if type_name.eq_ignore_ascii_case("TIMESTAMPTZ") => {
            JsonValue::String(row.try_get::<DateTime<Utc>, _>(idx)?.to_rfc3339())
        }
        ColumnKind::Timestamp => JsonValue::String(
            row.try_get::<NaiveDateTime, _>(idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        ColumnKind::Date => JsonValue::String(row.try_get::<NaiveDate, _>(idx)?.to_string()),
        ColumnKind::Text => JsonValue::String(row.try_get(idx)?),
        ColumnKind::Other => match row.try_get::<String, _>(idx) {
            Ok(text) => JsonValue::String(text),
            Err(e) => postgres_text_form(row, idx).ok_or(e)?,
        },
    };
    Ok(value)
}

/// The server's own rendering of a value, available when the row came back
/// in text format (statements without parameters).
fn postgres_text_form(row: &PgRow, idx: usize) -> Option<JsonValue> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.format() != PgValueFormat::Text {
        return None;
    }
    raw.as_str().ok().map(|text| JsonValue::String(text.to_string()))
}

fn decode_sqlite(
    row: &SqliteRow,
    idx: usize,
    kind: ColumnKind,
    _type_name: &str,
) -> Result<JsonValue, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(JsonValue::Null);
    }
    let typed = match kind {
        ColumnKind::Integer => row.try_get::<i64, _>(idx).map(JsonValue::from),
        ColumnKind::Boolean => row.try_get::<bool, _>(idx).map(JsonValue::Bool),
        ColumnKind::Float | ColumnKind::Numeric => row.try_get::<f64, _>(idx).map(float),
        ColumnKind::Bytes => row.try_get::<Vec<u8>, _>(idx).map(|b| encode_bytes(&b)),
        ColumnKind::Json => row
            .try_get::<String, _>(idx)
            .map(|text| serde_json::from_str(&text).unwrap_or(JsonValue::String(text))),
        _ => row.try_get::<String, _>(idx).map(JsonValue::String),
    };
    // Any column may hold any storage class; read what is actually there.
    typed.or_else(|e| {
        row.try_get::<String, _>(idx)
            .map(JsonValue::String)
            .or_else(|_| row.try_get::<i64, _>(idx).map(JsonValue::from))
            .or_else(|_| row.try_get::<f64, _>(idx).map(float))
            .or_else(|_| row.try_get::<Vec<u8>, _>(idx).map(|b| encode_bytes(&b)))
            .map_err(|_| e)
    })
}
