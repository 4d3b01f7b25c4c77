//! Database transactions.
//!
//! A [`DbTransaction`] holds one pooled connection until it is committed or
//! rolled back. Dropping it without either rolls back and returns the
//! connection to the pool.

use crate::db::executor::{postgres, sqlite};
use crate::db::pool::DbPool;
use crate::db::{Dialect, Statement};
use crate::error::{DbError, DbResult};
use crate::models::JsonRow;
use sqlx::{Postgres, Sqlite, Transaction};
use tracing::debug;

/// Backend-specific transaction wrapper.
pub enum DbTransaction {
    Postgres(Transaction<'static, Postgres>),
    Sqlite(Transaction<'static, Sqlite>),
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.dialect()).finish()
    }
}

impl DbPool {
    /// Check out a connection and open a transaction on it.
    pub async fn begin(&self) -> DbResult<DbTransaction> {
        let tx = match (self.postgres(), self.sqlite()) {
            (Some(pool), _) => DbTransaction::Postgres(pool.begin().await.map_err(DbError::from)?),
            (None, Some(pool)) => DbTransaction::Sqlite(pool.begin().await.map_err(DbError::from)?),
            (None, None) => return Err(DbError::internal("Pool has no backend")),
        };
        debug!(dialect = %tx.dialect(), "Transaction started");
        Ok(tx)
    }
}

impl DbTransaction {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbTransaction::Postgres(_) => Dialect::Postgres,
            DbTransaction::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<u64> {
        debug!(sql = %statement.text(), params = statement.params().len(), "Executing in transaction");
        match self {
            DbTransaction::Postgres(tx) => postgres::execute(&mut **tx, statement).await,
            DbTransaction::Sqlite(tx) => sqlite::execute(&mut **tx, statement).await,
        }
    }

    /// Execute a query inside the transaction and return its rows.
    pub async fn fetch_all(&mut self, statement: &Statement) -> DbResult<Vec<JsonRow>> {
        debug!(sql = %statement.text(), params = statement.params().len(), "Fetching in transaction");
        match self {
            DbTransaction::Postgres(tx) => postgres::fetch_all(&mut **tx, statement).await,
            DbTransaction::Sqlite(tx) => sqlite::fetch_all(&mut **tx, statement).await,
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Sqlite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Sqlite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatabaseSettings;
    use crate::db::{DbPool, Statement};
    use crate::models::SqlValue;
    use tempfile::TempDir;

    async fn pool_with_table(dir: &TempDir) -> DbPool {
        let path = dir.path().join("tx.db");
        let settings = DatabaseSettings::new(format!("sqlite:{}", path.display())).unwrap();
        let pool = DbPool::connect(&settings).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            Vec::new(),
        ))
        .await
        .unwrap();
        pool
    }

    async fn count(pool: &DbPool) -> i64 {
        let mut conn = pool.acquire().await.unwrap();
        let rows = conn
            .fetch_all(&Statement::new("SELECT COUNT(*) AS n FROM items", Vec::new()))
            .await
            .unwrap();
        rows[0]["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_table(&dir).await;

        let mut tx = pool.begin().await.unwrap();
        tx.execute(&Statement::new(
            "INSERT INTO items (name) VALUES (?1)",
            vec![SqlValue::from("a")],
        ))
        .await
        .unwrap();
        let rows = tx
            .fetch_all(&Statement::new("SELECT name FROM items", Vec::new()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        tx.commit().await.unwrap();

        assert_eq!(count(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_table(&dir).await;

        let mut tx = pool.begin().await.unwrap();
        tx.execute(&Statement::new(
            "INSERT INTO items (name) VALUES (?1)",
            vec![SqlValue::from("a")],
        ))
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(count(&pool).await, 0);

        {
            let mut tx = pool.begin().await.unwrap();
            tx.execute(&Statement::new(
                "INSERT INTO items (name) VALUES (?1)",
                vec![SqlValue::from("b")],
            ))
            .await
            .unwrap();
        }
        assert_eq!(count(&pool).await, 0);
    }
}
