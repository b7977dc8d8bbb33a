//! ormcore Library
//!
//! A small object-relational persistence runtime: a registry that caches one
//! DAO per (connection source, entity type or table configuration), and a
//! transaction manager that layers nested transactions over connections
//! using savepoints and autocommit toggling.

pub mod config;
pub mod dao;
pub mod db;
pub mod error;
pub mod models;

pub use config::{PoolOptions, SourceConfig};
pub use dao::{BaseDao, Dao, DaoDescriptor, DaoRegistry};
pub use db::{ConnectionSource, DatabaseConnection, SqliteConnectionSource, TransactionManager};
pub use error::{OrmError, OrmResult};
pub use models::{Entity, EntityType, TableConfig};
