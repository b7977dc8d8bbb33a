//! Connection capabilities consumed by DAOs and the transaction manager.
//!
//! Both traits are synchronous: calls run on the caller's thread and may
//! block on pool acquisition or database round trips.

use crate::error::OrmResult;
use crate::models::{DatabaseType, SqlValue};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// One decoded row, keyed by column name.
pub type Row = Map<String, JsonValue>;

/// A named intermediate rollback point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of asking a source to pin a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// The connection is now pinned; the caller owns the pin.
    Pinned,
    /// The same connection was already pinned by an enclosing caller.
    AlreadyPinned,
}

/// A physical database connection.
pub trait DatabaseConnection: Send + Sync {
    /// Whether [`set_auto_commit`](Self::set_auto_commit) has any effect.
    fn is_auto_commit_supported(&self) -> OrmResult<bool>;

    fn is_auto_commit(&self) -> OrmResult<bool>;

    fn set_auto_commit(&self, auto_commit: bool) -> OrmResult<()>;

    /// Open a savepoint. `None` means the connection does not support them.
    fn set_savepoint(&self, name: &str) -> OrmResult<Option<Savepoint>>;

    /// Commit the savepoint, or the whole transaction when `None`.
    fn commit(&self, savepoint: Option<&Savepoint>) -> OrmResult<()>;

    /// Roll back to the savepoint, or the whole transaction when `None`.
    fn rollback(&self, savepoint: Option<&Savepoint>) -> OrmResult<()>;

    /// Run a statement, returning the number of rows affected.
    fn execute(&self, sql: &str, args: &[SqlValue]) -> OrmResult<u64>;

    /// Run a query and decode its first row.
    fn query_for_one(&self, sql: &str, args: &[SqlValue]) -> OrmResult<Option<Row>>;

    /// Hand the underlying resource back to its owner. Later calls fail.
    fn close(&self) -> OrmResult<()>;
}

/// Where DAOs and the transaction manager get connections from.
///
/// Implementations decide how connections are pooled; they must hand out
/// the pinned connection, if any, from
/// [`get_read_write_connection`](Self::get_read_write_connection) and treat
/// releasing it as a no-op.
///
/// Handing out the pinned connection must not count as an acquisition:
/// nested transactional calls obtain it without ever releasing it, and only
/// the caller that pinned it releases it, once.
pub trait ConnectionSource: Send + Sync {
    fn get_read_write_connection(&self) -> OrmResult<Arc<dyn DatabaseConnection>>;

    fn release_connection(&self, connection: &Arc<dyn DatabaseConnection>) -> OrmResult<()>;

    /// Pin `connection` for the current transaction.
    ///
    /// Pinning a connection other than the one already pinned is an error.
    fn save_special_connection(
        &self,
        connection: &Arc<dyn DatabaseConnection>,
    ) -> OrmResult<PinOutcome>;

    /// Remove the pin if `connection` holds it.
    fn clear_special_connection(&self, connection: &Arc<dyn DatabaseConnection>);

    /// The pinned connection, if any.
    fn special_connection(&self) -> Option<Arc<dyn DatabaseConnection>>;

    fn database_type(&self) -> DatabaseType;
}
