//! Parameterized statement construction.
//!
//! Every builder here is a pure function of its inputs and performs no I/O.
//! Two rules hold for every statement produced:
//!
//! - table and column names only reach the text through [`quote_identifier`]
//! - values only reach the database as bound parameters, never as text
//!
//! `LIMIT`/`OFFSET` are bound like any other value. `ORDER BY` columns cannot
//! be bound, so they are checked against the entity's declared columns first.

use crate::error::{DbError, DbResult};
use crate::models::{ColumnDef, ColumnType, PRIMARY_KEY, Record, SqlValue, TableDef};

/// SQL dialect of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Detect the dialect from a connection URL.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.trim().to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Numbered placeholder for a 1-based parameter index.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${}", index),
            Self::Sqlite => format!("?{}", index),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    fn column_type(self, column_type: ColumnType) -> &'static str {
        match (self, column_type) {
            (Self::Postgres, ColumnType::BigInt) => "BIGINT",
            (Self::Postgres, ColumnType::Integer) => "INTEGER",
            (Self::Postgres, ColumnType::Double) => "DOUBLE PRECISION",
            (Self::Postgres, ColumnType::Text) => "TEXT",
            (Self::Postgres, ColumnType::Boolean) => "BOOLEAN",
            (Self::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ",
            (Self::Postgres, ColumnType::Json) => "JSONB",
            (Self::Sqlite, ColumnType::BigInt | ColumnType::Integer) => "INTEGER",
            (Self::Sqlite, ColumnType::Double) => "REAL",
            (Self::Sqlite, ColumnType::Boolean) => "BOOLEAN",
            (Self::Sqlite, ColumnType::Text | ColumnType::Timestamp | ColumnType::Json) => "TEXT",
        }
    }

    fn primary_key_definition(self) -> &'static str {
        match self {
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Quote an identifier: wrap in double quotes and double any embedded quote.
pub fn quote_identifier(ident: &str) -> String {
    let escaped = ident.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Reject identifiers no quoting can make safe.
fn check_identifier(ident: &str) -> DbResult<()> {
    if ident.is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    if ident.contains('\0') {
        return Err(DbError::invalid_input("Identifier cannot contain NUL bytes"));
    }
    Ok(())
}

/// A statement ready for execution: text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    text: String,
    params: Vec<SqlValue>,
}

impl Statement {
    /// A caller-written statement. The text is used as-is.
    pub fn new(text: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn into_parts(self) -> (String, Vec<SqlValue>) {
        (self.text, self.params)
    }
}

impl<S: Into<String>> From<(S, Vec<SqlValue>)> for Statement {
    fn from((text, params): (S, Vec<SqlValue>)) -> Self {
        Self::new(text, params)
    }
}

/// Sort direction for [`OrderBy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Accumulates statement text and numbers placeholders as values are pushed.
struct StatementWriter {
    dialect: Dialect,
    text: String,
    params: Vec<SqlValue>,
}

impl StatementWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            text: String::new(),
            params: Vec::new(),
        }
    }

    fn push_sql(&mut self, sql: &str) {
        self.text.push_str(sql);
    }

    fn push_identifier(&mut self, ident: &str) -> DbResult<()> {
        check_identifier(ident)?;
        self.text.push_str(&quote_identifier(ident));
        Ok(())
    }

    fn push_param(&mut self, value: SqlValue) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.text.push_str(&placeholder);
    }

    fn finish(self) -> Statement {
        Statement {
            text: self.text,
            params: self.params,
        }
    }
}

/// Builds the statements the repository and schema initialization need.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    dialect: Dialect,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// `INSERT ... RETURNING *`. An empty record inserts all defaults.
    pub fn build_insert(&self, table: &str, record: &Record) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("INSERT INTO ");
        w.push_identifier(table)?;

        if record.is_empty() {
            w.push_sql(" DEFAULT VALUES RETURNING *");
            return Ok(w.finish());
        }

        w.push_sql(" (");
        for (i, column) in record.columns().enumerate() {
            if i > 0 {
                w.push_sql(", ");
            }
            w.push_identifier(column)?;
        }
        w.push_sql(") VALUES (");
        for (i, (_, value)) in record.iter().enumerate() {
            if i > 0 {
                w.push_sql(", ");
            }
            w.push_param(value.clone());
        }
        w.push_sql(") RETURNING *");
        Ok(w.finish())
    }

    pub fn build_select_by_id(&self, table: &str, id: i64) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("SELECT * FROM ");
        w.push_identifier(table)?;
        w.push_sql(" WHERE ");
        w.push_identifier(PRIMARY_KEY)?;
        w.push_sql(" = ");
        w.push_param(SqlValue::Int(id));
        Ok(w.finish())
    }

    /// `SELECT` with ANDed equality filters and bound `LIMIT`/`OFFSET`.
    ///
    /// `known_columns` is the entity's column set; an `order_by` naming any
    /// other column is rejected. Without `order_by` rows come back in primary
    /// key order.
    pub fn build_select_many(
        &self,
        table: &str,
        known_columns: &[&str],
        filters: &Record,
        limit: u32,
        offset: u32,
        order_by: Option<&OrderBy>,
    ) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("SELECT * FROM ");
        w.push_identifier(table)?;

        for (i, (column, value)) in filters.iter().enumerate() {
            w.push_sql(if i == 0 { " WHERE " } else { " AND " });
            w.push_identifier(column)?;
            if value.is_null() {
                w.push_sql(" IS NULL");
            } else {
                w.push_sql(" = ");
                w.push_param(value.clone());
            }
        }

        w.push_sql(" ORDER BY ");
        match order_by {
            Some(order) => {
                if !known_columns.contains(&order.column.as_str()) {
                    return Err(DbError::invalid_input(format!(
                        "Cannot order by unknown column '{}'",
                        order.column
                    )));
                }
                w.push_identifier(&order.column)?;
                w.push_sql(" ");
                w.push_sql(order.direction.keyword());
            }
            None => {
                w.push_identifier(PRIMARY_KEY)?;
                w.push_sql(" ASC");
            }
        }

        w.push_sql(" LIMIT ");
        w.push_param(SqlValue::Int(limit.into()));
        w.push_sql(" OFFSET ");
        w.push_param(SqlValue::Int(offset.into()));
        Ok(w.finish())
    }

    /// `UPDATE ... RETURNING *`, or `None` when there is nothing to set.
    pub fn build_update(&self, table: &str, id: i64, changes: &Record) -> DbResult<Option<Statement>> {
        if changes.is_empty() {
            return Ok(None);
        }

        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("UPDATE ");
        w.push_identifier(table)?;
        w.push_sql(" SET ");
        for (i, (column, value)) in changes.iter().enumerate() {
            if i > 0 {
                w.push_sql(", ");
            }
            w.push_identifier(column)?;
            w.push_sql(" = ");
            w.push_param(value.clone());
        }
        w.push_sql(" WHERE ");
        w.push_identifier(PRIMARY_KEY)?;
        w.push_sql(" = ");
        w.push_param(SqlValue::Int(id));
        w.push_sql(" RETURNING *");
        Ok(Some(w.finish()))
    }

    /// `DELETE ... RETURNING "id"`: a returned row means the record existed.
    pub fn build_delete(&self, table: &str, id: i64) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("DELETE FROM ");
        w.push_identifier(table)?;
        w.push_sql(" WHERE ");
        w.push_identifier(PRIMARY_KEY)?;
        w.push_sql(" = ");
        w.push_param(SqlValue::Int(id));
        w.push_sql(" RETURNING ");
        w.push_identifier(PRIMARY_KEY)?;
        Ok(w.finish())
    }

    /// One multi-row `INSERT ... RETURNING *`.
    ///
    /// Columns come from the first row; values are flattened row-major. A row
    /// missing one of those columns binds NULL, a row with an extra column is
    /// rejected.
    pub fn build_bulk_insert(&self, table: &str, rows: &[Record]) -> DbResult<Statement> {
        let Some(first) = rows.first() else {
            return Err(DbError::invalid_input("Bulk insert requires at least one row"));
        };
        let columns: Vec<&str> = first.columns().collect();
        if columns.is_empty() {
            return Err(DbError::invalid_input(
                "Bulk insert rows must contain at least one column",
            ));
        }
        for (index, row) in rows.iter().enumerate() {
            if let Some(extra) = row.columns().find(|c| !columns.contains(c)) {
                return Err(DbError::invalid_input(format!(
                    "Row {} has column '{}' not present in the first row",
                    index, extra
                )));
            }
        }

        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("INSERT INTO ");
        w.push_identifier(table)?;
        w.push_sql(" (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                w.push_sql(", ");
            }
            w.push_identifier(column)?;
        }
        w.push_sql(") VALUES ");
        for (r, row) in rows.iter().enumerate() {
            if r > 0 {
                w.push_sql(", ");
            }
            w.push_sql("(");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    w.push_sql(", ");
                }
                w.push_param(row.get(column).cloned().unwrap_or(SqlValue::Null));
            }
            w.push_sql(")");
        }
        w.push_sql(" RETURNING *");
        Ok(w.finish())
    }

    /// `CREATE TABLE IF NOT EXISTS` for a declared table.
    pub fn build_create_table(&self, table: &TableDef) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("CREATE TABLE IF NOT EXISTS ");
        w.push_identifier(table.name)?;
        w.push_sql(" (");
        w.push_identifier(PRIMARY_KEY)?;
        w.push_sql(" ");
        w.push_sql(self.dialect.primary_key_definition());
        for column in table.columns {
            w.push_sql(", ");
            self.write_column_definition(&mut w, column)?;
        }
        w.push_sql(")");
        Ok(w.finish())
    }

    fn write_column_definition(&self, w: &mut StatementWriter, column: &ColumnDef) -> DbResult<()> {
        w.push_identifier(column.name)?;
        w.push_sql(" ");
        w.push_sql(self.dialect.column_type(column.column_type));
        if !column.nullable {
            w.push_sql(" NOT NULL");
        }
        if column.unique {
            w.push_sql(" UNIQUE");
        }
        Ok(())
    }

    pub fn build_drop_table(&self, table: &str) -> DbResult<Statement> {
        let mut w = StatementWriter::new(self.dialect);
        w.push_sql("DROP TABLE IF EXISTS ");
        w.push_identifier(table)?;
        if self.dialect == Dialect::Postgres {
            w.push_sql(" CASCADE");
        }
        Ok(w.finish())
    }

    /// List the column names an existing table has, as `column_name` rows.
    ///
    /// The table name is bound, not quoted into the text: SQLite reads an
    /// unknown double-quoted name as a string literal, so selecting quoted
    /// columns would not reveal a missing one.
    pub fn build_column_listing(&self, table: &str) -> DbResult<Statement> {
        check_identifier(table)?;
        let mut w = StatementWriter::new(self.dialect);
        match self.dialect {
            Dialect::Postgres => w.push_sql(
                "SELECT column_name::text AS column_name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name::text = ",
            ),
            Dialect::Sqlite => w.push_sql("SELECT name AS column_name FROM pragma_table_info("),
        }
        w.push_param(SqlValue::Text(table.to_string()));
        if self.dialect == Dialect::Sqlite {
            w.push_sql(")");
        }
        Ok(w.finish())
    }
}
