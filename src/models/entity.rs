//! Entity shape declarations.
//!
//! An [`Entity`] declares its table name and its columns statically. The
//! repository derives every statement from that declaration, so no entity
//! needs hand-written SQL and no table name is ever hard-coded elsewhere.

use crate::error::{DbError, DbResult};
use crate::models::value::{JsonRow, Record, SqlValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Name of the auto-assigned primary-key column every entity carries.
pub const PRIMARY_KEY: &str = "id";

/// Logical column type, mapped to a concrete SQL type per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Integer,
    Double,
    Text,
    Boolean,
    Timestamp,
    Json,
}

/// A non-key column declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
}

impl ColumnDef {
    /// A `NOT NULL` column.
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            unique: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Convert a value to the bind type the column expects.
    ///
    /// RFC 3339 text becomes a timestamp for `Timestamp` columns, and every
    /// non-null value becomes a JSON document for `Json` columns.
    pub fn coerce_value(&self, value: SqlValue) -> SqlValue {
        match (self.column_type, value) {
            (ColumnType::Timestamp, SqlValue::Text(text)) => {
                match chrono::DateTime::parse_from_rfc3339(&text) {
                    Ok(ts) => SqlValue::Timestamp(ts.with_timezone(&chrono::Utc)),
                    Err(_) => SqlValue::Text(text),
                }
            }
            (ColumnType::Json, SqlValue::Bool(v)) => SqlValue::Json(JsonValue::Bool(v)),
            (ColumnType::Json, SqlValue::Int(v)) => SqlValue::Json(JsonValue::from(v)),
            (ColumnType::Json, SqlValue::Float(v)) => SqlValue::Json(JsonValue::from(v)),
            (ColumnType::Json, SqlValue::Text(v)) => SqlValue::Json(JsonValue::String(v)),
            (ColumnType::Double, SqlValue::Int(v)) => SqlValue::Float(v as f64),
            (_, value) => value,
        }
    }
}

/// A table known to schema initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    /// Non-key columns; the `id` primary key is implicit.
    pub columns: &'static [ColumnDef],
}

impl TableDef {
    pub const fn new(name: &'static str, columns: &'static [ColumnDef]) -> Self {
        Self { name, columns }
    }

    /// All column names, primary key first.
    pub fn column_names(&self) -> Vec<&'static str> {
        std::iter::once(PRIMARY_KEY)
            .chain(self.columns.iter().map(|c| c.name))
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == PRIMARY_KEY || self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Apply [`ColumnDef::coerce_value`] to every known column of a record.
    pub fn coerce_record(&self, record: Record) -> Record {
        record
            .into_iter()
            .map(|(name, value)| match self.column(&name) {
                Some(column) => {
                    let value = column.coerce_value(value);
                    (name, value)
                }
                None => (name, value),
            })
            .collect()
    }

    /// Normalize values whose storage type differs from the declared type.
    ///
    /// SQLite stores booleans as integers and JSON as text; this rewrites
    /// them so serde sees the declared shape.
    pub fn coerce_row(&self, row: &mut JsonRow) {
        for column in self.columns {
            let Some(value) = row.get_mut(column.name) else {
                continue;
            };
            let replacement = match (column.column_type, &*value) {
                (ColumnType::Boolean, JsonValue::Number(n)) => {
                    Some(JsonValue::Bool(n.as_i64().unwrap_or(0) != 0))
                }
                (ColumnType::Json, JsonValue::String(s)) => serde_json::from_str(s).ok(),
                _ => None,
            };
            if let Some(replacement) = replacement {
                *value = replacement;
            }
        }
    }
}

/// A record type persisted in its own table.
///
/// # Example
///
/// ```
/// use resilient_db::models::{ColumnDef, ColumnType, Entity};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     #[serde(default)]
///     id: Option<i64>,
///     name: String,
///     #[serde(default)]
///     email: Option<String>,
/// }
///
/// impl Entity for User {
///     const TABLE: &'static str = "users";
///     const COLUMNS: &'static [ColumnDef] = &[
///         ColumnDef::new("name", ColumnType::Text),
///         ColumnDef::new("email", ColumnType::Text).nullable().unique(),
///     ];
///
///     fn id(&self) -> Option<i64> {
///         self.id
///     }
/// }
///
/// assert_eq!(User::column_names(), vec!["id", "name", "email"]);
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
    /// Non-key columns in declaration order.
    const COLUMNS: &'static [ColumnDef];

    /// Server-assigned primary key; `None` before the record is persisted.
    fn id(&self) -> Option<i64>;

    fn table_def() -> TableDef {
        TableDef::new(Self::TABLE, Self::COLUMNS)
    }

    fn column_names() -> Vec<&'static str> {
        Self::table_def().column_names()
    }
}

/// Extract the insertable columns of an entity, in declaration order.
///
/// The primary key is never included. Columns the entity omits when
/// serialized (e.g. `skip_serializing_if`) are left out so database defaults
/// apply.
pub fn entity_to_record<E: Entity>(entity: &E) -> DbResult<Record> {
    let value = serde_json::to_value(entity)
        .map_err(|e| DbError::invalid_input(format!("Cannot serialize {}: {}", E::TABLE, e)))?;
    let JsonValue::Object(mut map) = value else {
        return Err(DbError::invalid_input(format!(
            "Entity for '{}' must serialize to an object",
            E::TABLE
        )));
    };
    let mut record = Record::new();
    for column in E::COLUMNS {
        if let Some(value) = map.remove(column.name) {
            record.insert(column.name, column.coerce_value(SqlValue::from_json(value)));
        }
    }
    Ok(record)
}

impl Record {
    /// See [`entity_to_record`].
    pub fn from_entity<E: Entity>(entity: &E) -> DbResult<Self> {
        entity_to_record(entity)
    }
}

/// Rebuild an entity from a decoded row.
pub fn entity_from_row<E: Entity>(mut row: JsonRow) -> DbResult<E> {
    E::table_def().coerce_row(&mut row);
    serde_json::from_value(JsonValue::Object(row))
        .map_err(|e| DbError::decode(format!("{} row: {}", E::TABLE, e)))
}
