//! Schema initialization for registered tables.
//!
//! Creation is additive (`CREATE TABLE IF NOT EXISTS`) followed by a column
//! check per table. When either fails, typically because an older table with
//! an incompatible shape exists, every registered table is dropped and the
//! creation runs once more. A second failure is logged and swallowed: the
//! process keeps serving without those tables.

use crate::db::pool::DbPool;
use crate::db::QueryBuilder;
use crate::error::{DbError, DbResult};
use crate::models::TableDef;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// How schema initialization ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// Nothing to create.
    Skipped,
    /// Tables exist with every declared column.
    Ready,
    /// Tables were dropped and created again.
    Recreated,
    /// Creation failed twice; tables may be missing.
    Failed,
}

/// Create every registered table, recreating them once on failure.
pub async fn initialize_schema(pool: &DbPool, tables: &[TableDef]) -> SchemaOutcome {
    if tables.is_empty() {
        debug!("No tables registered, skipping schema initialization");
        return SchemaOutcome::Skipped;
    }

    let err = match create_tables(pool, tables).await {
        Ok(()) => {
            info!(tables = tables.len(), "Schema ready");
            return SchemaOutcome::Ready;
        }
        Err(e) => e,
    };
    warn!(error = %err, "Schema does not match, dropping and recreating tables");

    if let Err(e) = drop_tables(pool, tables).await {
        error!(error = %e, "Failed to drop tables");
    }

    match create_tables(pool, tables).await {
        Ok(()) => {
            info!(tables = tables.len(), "Schema recreated");
            SchemaOutcome::Recreated
        }
        Err(e) => {
            error!(error = %e, "Schema recreation failed, continuing without tables");
            SchemaOutcome::Failed
        }
    }
}

async fn create_tables(pool: &DbPool, tables: &[TableDef]) -> DbResult<()> {
    let builder = QueryBuilder::new(pool.dialect());
    let mut tx = pool.begin().await?;

    for table in tables {
        let create = builder.build_create_table(table)?;
        tx.execute(&create)
            .await
            .map_err(|e| DbError::schema(format!("Cannot create table: {}", e), table.name))?;

        let listing = builder.build_column_listing(table.name)?;
        let rows = tx
            .fetch_all(&listing)
            .await
            .map_err(|e| DbError::schema(format!("Column check failed: {}", e), table.name))?;
        let existing: HashSet<&str> = rows
            .iter()
            .filter_map(|row| row.get("column_name").and_then(|v| v.as_str()))
            .collect();
        let missing: Vec<&str> = table
            .column_names()
            .into_iter()
            .filter(|column| !existing.contains(column))
            .collect();
        if !missing.is_empty() {
            return Err(DbError::schema(
                format!("Missing columns: {}", missing.join(", ")),
                table.name,
            ));
        }
        debug!(table = table.name, "Table ready");
    }

    tx.commit().await
}

async fn drop_tables(pool: &DbPool, tables: &[TableDef]) -> DbResult<()> {
    let builder = QueryBuilder::new(pool.dialect());
    let mut tx = pool.begin().await?;

    for table in tables.iter().rev() {
        let drop = builder.build_drop_table(table.name)?;
        tx.execute(&drop)
            .await
            .map_err(|e| DbError::schema(format!("Cannot drop table: {}", e), table.name))?;
        debug!(table = table.name, "Dropped table");
    }

    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::db::Statement;
    use crate::models::{ColumnDef, ColumnType};
    use tempfile::TempDir;

    const NOTES: TableDef = TableDef::new(
        "notes",
        &[
            ColumnDef::new("body", ColumnType::Text),
            ColumnDef::new("pinned", ColumnType::Boolean),
        ],
    );

    async fn pool(dir: &TempDir) -> DbPool {
        let path = dir.path().join("schema.db");
        let settings = DatabaseSettings::new(format!("sqlite:{}", path.display())).unwrap();
        DbPool::connect(&settings).await.unwrap()
    }

    #[tokio::test]
    async fn test_creates_then_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        assert_eq!(initialize_schema(&pool, &[NOTES]).await, SchemaOutcome::Ready);

        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new(
            "INSERT INTO \"notes\" (\"body\", \"pinned\") VALUES ('kept', 0)",
            Vec::new(),
        ))
        .await
        .unwrap();
        drop(conn);

        assert_eq!(initialize_schema(&pool, &[NOTES]).await, SchemaOutcome::Ready);
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn
            .fetch_all(&Statement::new("SELECT body FROM notes", Vec::new()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_table_is_recreated() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, legacy TEXT)",
            Vec::new(),
        ))
        .await
        .unwrap();
        drop(conn);

        assert_eq!(
            initialize_schema(&pool, &[NOTES]).await,
            SchemaOutcome::Recreated
        );

        let mut conn = pool.acquire().await.unwrap();
        conn.fetch_all(&Statement::new("SELECT id, body, pinned FROM notes", Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_tables_is_skipped() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        assert_eq!(initialize_schema(&pool, &[]).await, SchemaOutcome::Skipped);
    }
}
