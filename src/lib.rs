//! Resilient database access.
//!
//! A connection lifecycle manager that keeps a PostgreSQL or SQLite pool
//! alive (connect with retry, periodic health probe, automatic rebuild) and a
//! generic repository whose every statement is built with quoted identifiers
//! and bound parameters. Data access waits for readiness instead of failing
//! during an outage; the health snapshot never waits.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod repository;

pub use config::Config;
pub use db::LifecycleManager;
pub use error::DbError;
pub use repository::{ListQuery, Repository};
