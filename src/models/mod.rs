//! Data models for the persistence runtime.
//!
//! This module re-exports the entity, table and value types used throughout
//! the crate.

pub mod connection;
pub mod entity;
pub mod table;
pub mod value;

// Re-export commonly used types
pub use connection::DatabaseType;
pub use entity::{Entity, EntityType};
pub use table::{FieldConfig, TableConfig};
pub use value::SqlValue;
