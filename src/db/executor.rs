//! Statement execution.
//!
//! Runs built [`Statement`]s over a single connection and decodes the result
//! rows to JSON maps. Statements on one connection run in submission order.
//!
//! # Architecture
//!
//! The backend-specific halves live in submodules:
//! - `postgres`: PostgreSQL execution over a `PgConnection`
//! - `sqlite`: SQLite execution over a `SqliteConnection`
//!
//! Both take a plain connection so the same code serves pooled connections
//! and open transactions. Statements without parameters go through the
//! unprepared path, which DDL and multi-statement text need.

use crate::db::Statement;
use crate::db::pool::ConnectionHandle;
use crate::db::types::RowToJson;
use crate::error::DbResult;
use crate::models::JsonRow;
use futures_util::TryStreamExt;
use tracing::debug;

impl ConnectionHandle {
    /// Execute a statement and return every result row.
    pub async fn fetch_all(&mut self, statement: &Statement) -> DbResult<Vec<JsonRow>> {
        debug!(sql = %statement.text(), params = statement.params().len(), "Fetching rows");
        match self {
            Self::Postgres(conn) => postgres::fetch_all(&mut **conn, statement).await,
            Self::Sqlite(conn) => sqlite::fetch_all(&mut **conn, statement).await,
        }
    }

    /// Execute a statement and return its first row, if any.
    pub async fn fetch_optional(&mut self, statement: &Statement) -> DbResult<Option<JsonRow>> {
        debug!(sql = %statement.text(), params = statement.params().len(), "Fetching row");
        match self {
            Self::Postgres(conn) => postgres::fetch_optional(&mut **conn, statement).await,
            Self::Sqlite(conn) => sqlite::fetch_optional(&mut **conn, statement).await,
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<u64> {
        debug!(sql = %statement.text(), params = statement.params().len(), "Executing statement");
        match self {
            Self::Postgres(conn) => postgres::execute(&mut **conn, statement).await,
            Self::Sqlite(conn) => sqlite::execute(&mut **conn, statement).await,
        }
    }
}

pub(crate) mod postgres {
    use super::*;
    use crate::db::params::postgres_query;
    use sqlx::PgConnection;
    use sqlx::postgres::PgRow;

    pub async fn fetch_all(conn: &mut PgConnection, statement: &Statement) -> DbResult<Vec<JsonRow>> {
        let rows: Vec<PgRow> = if statement.params().is_empty() {
            sqlx::Executor::fetch(&mut *conn, statement.text())
                .try_collect()
                .await?
        } else {
            postgres_query(statement)
                .fetch(&mut *conn)
                .try_collect()
                .await?
        };
        rows.iter().map(RowToJson::to_json_map).collect()
    }

    pub async fn fetch_optional(
        conn: &mut PgConnection,
        statement: &Statement,
    ) -> DbResult<Option<JsonRow>> {
        let row = if statement.params().is_empty() {
            sqlx::Executor::fetch_optional(&mut *conn, statement.text()).await?
        } else {
            postgres_query(statement).fetch_optional(&mut *conn).await?
        };
        row.as_ref().map(RowToJson::to_json_map).transpose()
    }

    pub async fn execute(conn: &mut PgConnection, statement: &Statement) -> DbResult<u64> {
        let result = if statement.params().is_empty() {
            sqlx::Executor::execute(&mut *conn, statement.text()).await?
        } else {
            postgres_query(statement).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }
}

pub(crate) mod sqlite {
    use super::*;
    use crate::db::params::sqlite_query;
    use sqlx::SqliteConnection;
    use sqlx::sqlite::SqliteRow;

    pub async fn fetch_all(
        conn: &mut SqliteConnection,
        statement: &Statement,
    ) -> DbResult<Vec<JsonRow>> {
        let rows: Vec<SqliteRow> = if statement.params().is_empty() {
            sqlx::Executor::fetch(&mut *conn, statement.text())
                .try_collect()
                .await?
        } else {
            sqlite_query(statement)
                .fetch(&mut *conn)
                .try_collect()
                .await?
        };
        rows.iter().map(RowToJson::to_json_map).collect()
    }

    pub async fn fetch_optional(
        conn: &mut SqliteConnection,
        statement: &Statement,
    ) -> DbResult<Option<JsonRow>> {
        let row = if statement.params().is_empty() {
            sqlx::Executor::fetch_optional(&mut *conn, statement.text()).await?
        } else {
            sqlite_query(statement).fetch_optional(&mut *conn).await?
        };
        row.as_ref().map(RowToJson::to_json_map).transpose()
    }

    pub async fn execute(conn: &mut SqliteConnection, statement: &Statement) -> DbResult<u64> {
        let result = if statement.params().is_empty() {
            sqlx::Executor::execute(&mut *conn, statement.text()).await?
        } else {
            sqlite_query(statement).execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }
}
