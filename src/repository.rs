//! Generic repository.
//!
//! The single persistence interface for application code. Every operation
//! first waits for the lifecycle manager to report the database ready, so an
//! outage shows up as latency instead of an error. Table and column names
//! always come from the entity's declaration; caller-supplied keys (filters,
//! updates, bulk rows) are checked against it before any SQL is built.
//!
//! A failed connection checkout sends nothing to the server, so every
//! operation retries it once the lifecycle manager confirms the database is
//! unreachable; a checkout that fails while the server answers probes is
//! real pool exhaustion and is returned. Reads (`get_by_id`, `list`) are
//! also retried when the statement itself fails on a lost connection.
//! Writes are not, since the first attempt may have been applied.

use crate::config::DEFAULT_MAX_LIST_LIMIT;
use crate::db::{ConnectionHandle, DbPool, LifecycleManager, OrderBy, QueryBuilder, Statement};
use crate::error::{DbError, DbResult, ResultExt};
use crate::models::{
    Entity, JsonRow, PRIMARY_KEY, Record, SqlValue, entity_from_row, entity_to_record,
};
use std::future::Future;
use tracing::{debug, error, warn};

/// Statement-level connectivity failures tolerated while probes still pass.
const MAX_READ_RETRIES_WHILE_REACHABLE: u32 = 3;

/// Default page size for [`ListQuery`].
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Paging, filtering and ordering for [`Repository::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub limit: u32,
    pub offset: u32,
    /// Equality filters, ANDed. A NULL value matches `IS NULL`.
    pub filters: Record,
    pub order_by: Option<OrderBy>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            filters: Record::new(),
            order_by: None,
        }
    }
}

impl ListQuery {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.filters.insert(column, value);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }
}

/// CRUD and raw statement execution over the managed pool.
#[derive(Debug, Clone)]
pub struct Repository {
    lifecycle: LifecycleManager,
    max_list_limit: u32,
}

impl Repository {
    pub fn new(lifecycle: LifecycleManager) -> Self {
        Self {
            lifecycle,
            max_list_limit: DEFAULT_MAX_LIST_LIMIT,
        }
    }

    /// Set the ceiling applied to every `list` limit. Never below 1.
    pub fn with_max_list_limit(mut self, max_list_limit: u32) -> Self {
        self.max_list_limit = max_list_limit.max(1);
        self
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn max_list_limit(&self) -> u32 {
        self.max_list_limit
    }

    /// Insert an entity and return it as stored, with its assigned id and
    /// column defaults.
    pub async fn create<E: Entity>(&self, entity: &E) -> DbResult<E> {
        let record = entity_to_record(entity).context("create", E::TABLE)?;
        let statement = self
            .builder()
            .build_insert(E::TABLE, &record)
            .context("create", E::TABLE)?;

        let mut conn = self.connection().await.context("create", E::TABLE)?;
        let row = conn
            .fetch_optional(&statement)
            .await
            .context("create", E::TABLE)?
            .ok_or_else(|| DbError::internal("Insert returned no row"))
            .context("create", E::TABLE)?;
        entity_from_row(row).context("create", E::TABLE)
    }

    /// Fetch one entity by primary key; `None` when absent.
    pub async fn get_by_id<E: Entity>(&self, id: i64) -> DbResult<Option<E>> {
        let statement = self
            .builder()
            .build_select_by_id(E::TABLE, id)
            .context("get_by_id", E::TABLE)?;
        let statement = &statement;

        let row = self
            .read_with_retry("get_by_id", E::TABLE, |mut conn| async move {
                conn.fetch_optional(statement).await
            })
            .await?;
        row.map(entity_from_row).transpose().context("get_by_id", E::TABLE)
    }

    /// Fetch a page of entities.
    ///
    /// `limit` is clamped to the repository ceiling. Without an explicit
    /// ordering rows come back in id order.
    pub async fn list<E: Entity>(&self, query: &ListQuery) -> DbResult<Vec<E>> {
        let columns = E::column_names();
        check_columns::<E>(query.filters.columns(), false).context("list", E::TABLE)?;
        let filters = E::table_def().coerce_record(query.filters.clone());
        let limit = query.limit.min(self.max_list_limit);
        if limit < query.limit {
            debug!(requested = query.limit, limit, "Clamped list limit");
        }

        let statement = self
            .builder()
            .build_select_many(
                E::TABLE,
                &columns,
                &filters,
                limit,
                query.offset,
                query.order_by.as_ref(),
            )
            .context("list", E::TABLE)?;
        let statement = &statement;

        let rows = self
            .read_with_retry("list", E::TABLE, |mut conn| async move {
                conn.fetch_all(statement).await
            })
            .await?;
        rows.into_iter()
            .map(entity_from_row)
            .collect::<DbResult<Vec<E>>>()
            .context("list", E::TABLE)
    }

    /// Apply a partial update and return the updated entity; `None` when no
    /// row has that id.
    ///
    /// An empty change set sends no statement and returns the current row.
    pub async fn update<E: Entity>(&self, id: i64, changes: &Record) -> DbResult<Option<E>> {
        check_columns::<E>(changes.columns(), true).context("update", E::TABLE)?;
        if changes.is_empty() {
            debug!(table = E::TABLE, id, "Empty update, returning current row");
            return self.get_by_id(id).await;
        }
        let changes = E::table_def().coerce_record(changes.clone());
        let statement = self
            .builder()
            .build_update(E::TABLE, id, &changes)
            .context("update", E::TABLE)?
            .ok_or_else(|| DbError::internal("Update produced no statement"))?;

        let mut conn = self.connection().await.context("update", E::TABLE)?;
        let row = conn
            .fetch_optional(&statement)
            .await
            .context("update", E::TABLE)?;
        row.map(entity_from_row).transpose().context("update", E::TABLE)
    }

    /// Delete by primary key. Returns whether a row existed.
    pub async fn delete<E: Entity>(&self, id: i64) -> DbResult<bool> {
        let statement = self
            .builder()
            .build_delete(E::TABLE, id)
            .context("delete", E::TABLE)?;
        let mut conn = self.connection().await.context("delete", E::TABLE)?;
        let row = conn
            .fetch_optional(&statement)
            .await
            .context("delete", E::TABLE)?;
        Ok(row.is_some())
    }

    /// Insert many rows with one statement and return them in input order.
    pub async fn bulk_create<E: Entity>(&self, rows: &[Record]) -> DbResult<Vec<E>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        for row in rows {
            check_columns::<E>(row.columns(), true).context("bulk_create", E::TABLE)?;
        }
        let table = E::table_def();
        let rows: Vec<Record> = rows
            .iter()
            .map(|row| table.coerce_record(row.clone()))
            .collect();
        let statement = self
            .builder()
            .build_bulk_insert(E::TABLE, &rows)
            .context("bulk_create", E::TABLE)?;

        let mut conn = self.connection().await.context("bulk_create", E::TABLE)?;
        let mut returned = conn
            .fetch_all(&statement)
            .await
            .context("bulk_create", E::TABLE)?;

        // RETURNING order is unspecified; ids are assigned in VALUES order.
        returned.sort_by_key(|row| row.get(PRIMARY_KEY).and_then(|v| v.as_i64()));
        returned
            .into_iter()
            .map(entity_from_row)
            .collect::<DbResult<Vec<E>>>()
            .context("bulk_create", E::TABLE)
    }

    /// Run a caller-written query and return its rows as JSON maps.
    pub async fn execute_raw_query(
        &self,
        text: &str,
        params: Vec<SqlValue>,
    ) -> DbResult<Vec<JsonRow>> {
        let statement = Statement::new(text, params);
        let mut conn = self.connection().await.context("query", "raw")?;
        conn.fetch_all(&statement).await.context("query", "raw")
    }

    /// Run a caller-written statement and return the affected row count.
    pub async fn execute_command(&self, text: &str, params: Vec<SqlValue>) -> DbResult<u64> {
        let statement = Statement::new(text, params);
        let mut conn = self.connection().await.context("execute", "raw")?;
        conn.execute(&statement).await.context("execute", "raw")
    }

    /// Run statements on one connection inside a transaction.
    ///
    /// Commits only when every statement succeeds; otherwise the whole
    /// sequence is rolled back and the first error is returned.
    pub async fn execute_transaction<I>(&self, statements: I) -> DbResult<()>
    where
        I: IntoIterator<Item = Statement>,
    {
        let statements: Vec<Statement> = statements.into_iter().collect();
        let mut tx = self
            .checkout(|pool| async move { pool.begin().await })
            .await
            .context("transaction", "begin")?;

        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = tx.execute(statement).await {
                error!(
                    index,
                    total = statements.len(),
                    error = %e,
                    "Statement failed, rolling back transaction"
                );
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e.with_operation("transaction", format!("statement {}", index)));
            }
        }

        tx.commit().await.context("transaction", "commit")?;
        debug!(statements = statements.len(), "Transaction committed");
        Ok(())
    }

    fn builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.lifecycle.dialect())
    }

    async fn connection(&self) -> DbResult<ConnectionHandle> {
        self.checkout(|pool| async move { pool.acquire().await })
            .await
    }

    /// Take something out of the ready pool, waiting out outages.
    ///
    /// Fails with the checkout error only when the lifecycle manager finds
    /// the server reachable, i.e. the pool is genuinely exhausted.
    async fn checkout<T, F, Fut>(&self, take: F) -> DbResult<T>
    where
        F: Fn(DbPool) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let pool = self.lifecycle.wait_until_ready().await?;
            match take(pool).await {
                Ok(value) => return Ok(value),
                Err(e) if is_checkout_failure(&e) && !self.lifecycle.is_closed() => {
                    if !self.lifecycle.confirm_outage().await {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(attempt, error = %e, "Database unreachable, waiting for reconnect");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run an idempotent read, retrying after connectivity failures until it
    /// succeeds or fails for another reason.
    async fn read_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        table: &str,
        op: F,
    ) -> DbResult<T>
    where
        F: Fn(ConnectionHandle) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let backoff = self.lifecycle.settings().reconnect.retry_backoff;
        let mut reachable_failures: u32 = 0;
        loop {
            let conn = self.connection().await.context(operation, table)?;
            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connectivity() && !self.lifecycle.is_closed() => {
                    warn!(
                        operation,
                        table,
                        error = %e,
                        "Read failed on a lost connection, retrying"
                    );
                    if !self.lifecycle.confirm_outage().await {
                        reachable_failures += 1;
                        if reachable_failures > MAX_READ_RETRIES_WHILE_REACHABLE {
                            return Err(e.with_operation(operation, table));
                        }
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => return Err(e.with_operation(operation, table)),
            }
        }
    }
}

/// Errors from taking a connection out of the pool. Nothing reached the
/// server, so the operation can always be repeated.
fn is_checkout_failure(err: &DbError) -> bool {
    matches!(
        err.root(),
        DbError::PoolExhausted { .. } | DbError::PoolClosed | DbError::Connection { .. }
    )
}

/// Reject keys the entity does not declare, and `id` when it may not be set.
fn check_columns<'a, E: Entity>(
    columns: impl Iterator<Item = &'a str>,
    writing: bool,
) -> DbResult<()> {
    let table = E::table_def();
    for column in columns {
        if writing && column == PRIMARY_KEY {
            return Err(DbError::invalid_input(format!(
                "Column '{}' is assigned by the database and cannot be set",
                PRIMARY_KEY
            )));
        }
        if !table.has_column(column) {
            return Err(DbError::invalid_input(format!(
                "Unknown column '{}' for table '{}'",
                column,
                E::TABLE
            )));
        }
    }
    Ok(())
}
