//! Error types for the resilient database layer.
//!
//! All failures are expressed through [`DbError`]. Connectivity problems are
//! normally absorbed by the lifecycle manager; everything that does reach a
//! caller is classified so an HTTP layer can map it to a status code without
//! inspecting message text.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// Constraint violations and malformed statements.
    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Connection pool exhausted: no connection available after {waited_secs}s")]
    PoolExhausted { waited_secs: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Database feature is disabled by configuration")]
    FeatureDisabled,

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Failed to decode row: {message}")]
    Decode { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{operation} on '{target}' failed: {source}")]
    Operation {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with the operation and table (or other target) it came from.
    pub fn with_operation(self, operation: &'static str, target: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any operation context.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self.root() {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// True for failures caused by losing the database rather than by the request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self.root(), Self::Connection { .. } | Self::PoolClosed)
    }

    /// True for failures the caller caused (maps to a 4xx response).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            Self::Database { .. } | Self::InvalidInput { .. } | Self::Schema { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. }
        )
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::InvalidInput { .. } | Self::Database { .. } | Self::Schema { .. } => 400,
            Self::FeatureDisabled | Self::PoolClosed | Self::PoolExhausted { .. } => 503,
            Self::Connection { .. } => 503,
            Self::Timeout { .. } => 504,
            _ => 500,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation => {
                        "A record with the same unique value already exists"
                    }
                    sqlx::error::ErrorKind::ForeignKeyViolation => {
                        "The referenced record does not exist"
                    }
                    sqlx::error::ErrorKind::NotNullViolation => "Provide a value for every required column",
                    sqlx::error::ErrorKind::CheckViolation => "The value violates a check constraint",
                    _ => "Check the SQL syntax and referenced objects",
                };
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted { waited_secs: 0 },
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::decode(source.to_string()),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection will be re-established automatically",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Attach operation context to a failed result.
pub trait ResultExt<T> {
    fn context(self, operation: &'static str, target: &str) -> DbResult<T>;
}

impl<T> ResultExt<T> for DbResult<T> {
    fn context(self, operation: &'static str, target: &str) -> DbResult<T> {
        self.map_err(|e| e.with_operation(operation, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(err.sql_state(), Some("42601"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_operation_context_display() {
        let err = DbError::database("duplicate key", Some("23505".into()), "unique")
            .with_operation("create", "users");
        let text = err.to_string();
        assert!(text.starts_with("create on 'users' failed"));
        assert!(text.contains("duplicate key"));
    }

    #[test]
    fn test_classification_looks_through_context() {
        let err = DbError::PoolClosed.with_operation("list", "users");
        assert!(err.is_connectivity());
        assert!(!err.is_client_error());
        assert!(matches!(err.root(), DbError::PoolClosed));

        let err = DbError::invalid_input("unknown column").with_operation("update", "users");
        assert!(err.is_client_error());
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DbError::invalid_input("x").status_code(), 400);
        assert_eq!(DbError::database("x", None, "y").status_code(), 400);
        assert_eq!(DbError::FeatureDisabled.status_code(), 503);
        assert_eq!(DbError::PoolClosed.status_code(), 503);
        assert_eq!(DbError::PoolExhausted { waited_secs: 30 }.status_code(), 503);
        assert_eq!(DbError::timeout("probe", 5).status_code(), 504);
        assert_eq!(DbError::internal("x").status_code(), 500);
    }

    #[test]
    fn test_pool_errors_map_to_distinct_variants() {
        assert!(matches!(
            DbError::from(sqlx::Error::PoolClosed),
            DbError::PoolClosed
        ));
        assert!(matches!(
            DbError::from(sqlx::Error::PoolTimedOut),
            DbError::PoolExhausted { .. }
        ));
    }

    #[test]
    fn test_result_ext_context() {
        let result: DbResult<()> = Err(DbError::decode("bad row"));
        let err = result.context("get", "users").unwrap_err();
        assert!(matches!(err, DbError::Operation { operation: "get", .. }));
    }
}
