//! Database access layer.
//!
//! This module provides:
//! - Statement building with centralized identifier quoting
//! - Connection pooling over the sqlx backend pools
//! - Statement execution and row decoding
//! - Transactions
//! - The connection lifecycle (connect with retry, health probe, readiness)
//! - Schema initialization for registered tables

pub mod executor;
pub mod lifecycle;
pub mod params;
pub mod pool;
pub mod statement;
pub mod tables;
pub mod transaction;
pub mod types;

pub use lifecycle::LifecycleManager;
pub use pool::{ConnectionHandle, DbPool};
pub use statement::{
    Dialect, OrderBy, QueryBuilder, SortDirection, Statement, quote_identifier,
};
pub use tables::{SchemaOutcome, initialize_schema};
pub use transaction::DbTransaction;
