//! Data models for the database layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod entity;
pub mod health;
pub mod value;

// Re-export commonly used types
pub use entity::{
    ColumnDef, ColumnType, Entity, PRIMARY_KEY, TableDef, entity_from_row, entity_to_record,
};
pub use health::{HealthSnapshot, HealthStatus, PoolState};
pub use value::{JsonRow, Record, SqlValue};
