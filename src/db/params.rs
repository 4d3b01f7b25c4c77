//! Parameter binding for built statements.
//!
//! Binds [`SqlValue`]s to backend-specific sqlx query objects, in placeholder
//! order.

use crate::db::Statement;
use crate::models::SqlValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Postgres, Sqlite};

pub(crate) type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A NULL parameter whose type the server infers from the statement.
///
/// A typed NULL (e.g. `Option<String>`) is rejected by PostgreSQL when the
/// target column is not text.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a value to a PostgreSQL query.
pub(crate) fn bind_postgres_value<'q>(query: PgQuery<'q>, value: &'q SqlValue) -> PgQuery<'q> {
    match value {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a value to a SQLite query.
pub(crate) fn bind_sqlite_value<'q>(
    query: SqliteQuery<'q>,
    value: &'q SqlValue,
) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Timestamp(v) => query.bind(v.to_rfc3339()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}

/// Build a PostgreSQL query with every parameter of the statement bound.
pub(crate) fn postgres_query(statement: &Statement) -> PgQuery<'_> {
    statement
        .params()
        .iter()
        .fold(sqlx::query(statement.text()), bind_postgres_value)
}

/// Build a SQLite query with every parameter of the statement bound.
pub(crate) fn sqlite_query(statement: &Statement) -> SqliteQuery<'_> {
    statement
        .params()
        .iter()
        .fold(sqlx::query(statement.text()), bind_sqlite_value)
}
