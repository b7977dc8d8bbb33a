//! Database abstraction layer.
//!
//! This module provides:
//! - The connection capabilities DAOs and transactions are written against
//! - The pin slot connection sources use to serve one transaction connection
//! - A SQLite connection source backed by an sqlx pool
//! - Parameter binding and row decoding for that source
//! - The transaction manager

pub mod connection;
pub mod params;
pub mod special;
pub mod sqlite;
pub mod transaction_manager;
pub mod types;

pub use connection::{ConnectionSource, DatabaseConnection, PinOutcome, Row, Savepoint};
pub use special::SpecialConnection;
pub use sqlite::{SqliteConnectionSource, SqliteDatabaseConnection};
pub use transaction_manager::TransactionManager;
