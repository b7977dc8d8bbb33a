//! Nested logical transactions over a connection source.
//!
//! The outermost [`TransactionManager::call_in_transaction`] on a source pins
//! one connection, so every DAO call made by the unit of work (including
//! nested transactional calls) runs on it. Only the outermost level touches
//! autocommit, savepoints, and the pin.
//!
//! # Panic Safety
//!
//! Cleanup lives in drop guards: a unit of work that unwinds still has its
//! savepoint rolled back, autocommit restored, and the connection unpinned
//! and released.

use crate::db::{ConnectionSource, DatabaseConnection, PinOutcome, Savepoint};
use crate::error::{OrmError, OrmResult};
use crate::models::DatabaseType;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Runs units of work inside a transaction on its connection source.
///
/// Either construct it with [`new`](Self::new), or start from
/// [`Default`], call [`set_connection_source`](Self::set_connection_source)
/// and check the wiring with [`initialize`](Self::initialize).
#[derive(Default)]
pub struct TransactionManager {
    source: Option<Arc<dyn ConnectionSource>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field(
                "database_type",
                &self.source.as_ref().map(|s| s.database_type()),
            )
            .finish()
    }
}

impl TransactionManager {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub fn set_connection_source(&mut self, source: Arc<dyn ConnectionSource>) {
        self.source = Some(source);
    }

    pub fn connection_source(&self) -> Option<&Arc<dyn ConnectionSource>> {
        self.source.as_ref()
    }

    /// Fail fast if no connection source has been set.
    pub fn initialize(&self) -> OrmResult<()> {
        self.require_source().map(|_| ())
    }

    fn require_source(&self) -> OrmResult<&Arc<dyn ConnectionSource>> {
        self.source
            .as_ref()
            .ok_or_else(|| OrmError::illegal_state("TransactionManager has no connection source"))
    }

    /// Run `work` in a transaction on the configured source.
    ///
    /// Errors returned by `work` come back unchanged after the transaction
    /// is rolled back. Failures of the transaction machinery itself are
    /// converted into `E`.
    pub fn call_in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<OrmError>,
    {
        let source = self.require_source()?;
        Self::call_in_transaction_with(source.as_ref(), work)
    }

    /// Run `work` in a transaction on `source`.
    pub fn call_in_transaction_with<T, E, F>(source: &dyn ConnectionSource, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<OrmError>,
    {
        let connection = source.get_read_write_connection()?;
        let mut lease = ConnectionLease::new(source, connection);

        match lease.pin() {
            Ok(PinOutcome::Pinned) => {}
            Ok(PinOutcome::AlreadyPinned) => {
                // The enclosing call owns commit, rollback and release. The
                // pinned connection is not released here, see ConnectionSource.
                lease.disarm();
                debug!("Joining enclosing transaction");
                return work();
            }
            Err(err) => return lease.finish(Err(E::from(err))),
        }

        let result = match TransactionScope::begin(lease.connection().as_ref(), source.database_type())
        {
            Ok(scope) => scope.run(work),
            Err(err) => Err(E::from(err)),
        };
        lease.finish(result)
    }
}

fn savepoint_name() -> String {
    format!("sp_{}", uuid::Uuid::new_v4().simple())
}

/// The acquired connection, unpinned and released exactly once.
struct ConnectionLease<'a> {
    source: &'a dyn ConnectionSource,
    connection: Arc<dyn DatabaseConnection>,
    pinned: bool,
    released: bool,
}

impl<'a> ConnectionLease<'a> {
    fn new(source: &'a dyn ConnectionSource, connection: Arc<dyn DatabaseConnection>) -> Self {
        Self {
            source,
            connection,
            pinned: false,
            released: false,
        }
    }

    fn connection(&self) -> &Arc<dyn DatabaseConnection> {
        &self.connection
    }

    fn pin(&mut self) -> OrmResult<PinOutcome> {
        let outcome = self.source.save_special_connection(&self.connection)?;
        self.pinned = outcome == PinOutcome::Pinned;
        Ok(outcome)
    }

    /// Give up ownership without touching the connection.
    fn disarm(mut self) {
        self.released = true;
    }

    /// Unpin and release, keeping an earlier error ahead of a release failure.
    fn finish<T, E: From<OrmError>>(mut self, result: Result<T, E>) -> Result<T, E> {
        self.released = true;
        match (result, self.unpin_and_release()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(E::from(release_err)),
            (Err(err), Err(release_err)) => {
                error!(error = %release_err, "Failed to release transaction connection");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    fn unpin_and_release(&mut self) -> OrmResult<()> {
        if self.pinned {
            self.source.clear_special_connection(&self.connection);
            self.pinned = false;
        }
        self.source.release_connection(&self.connection)
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Transaction connection released via Drop");
        if let Err(err) = self.unpin_and_release() {
            error!(error = %err, "Failed to release transaction connection");
        }
    }
}

/// Savepoint and autocommit state of the outermost transaction level.
struct TransactionScope<'a> {
    connection: &'a dyn DatabaseConnection,
    savepoint: Option<Savepoint>,
    restore_auto_commit: bool,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    fn begin(connection: &'a dyn DatabaseConnection, db_type: DatabaseType) -> OrmResult<Self> {
        let mut scope = Self {
            connection,
            savepoint: None,
            restore_auto_commit: false,
            // Nothing to roll back until the savepoint exists
            finished: true,
        };
        if connection.is_auto_commit_supported()? && connection.is_auto_commit()? {
            connection.set_auto_commit(false)?;
            scope.restore_auto_commit = true;
            debug!("Disabled autocommit for transaction");
        }

        let name = savepoint_name();
        match connection.set_savepoint(&name) {
            Ok(savepoint) => scope.savepoint = savepoint,
            Err(err) => {
                scope.restore_quietly();
                return Err(OrmError::transaction("Could not set savepoint", name, err));
            }
        }

        scope.finished = false;
        debug!(
            savepoint = %scope.savepoint_name(),
            database_type = %db_type,
            "Started transaction"
        );
        Ok(scope)
    }

    fn run<T, E, F>(self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<OrmError>,
    {
        match work() {
            Ok(value) => self.commit().map(|()| value).map_err(E::from),
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn savepoint_name(&self) -> &str {
        self.savepoint.as_ref().map_or("<none>", Savepoint::name)
    }

    fn commit(mut self) -> OrmResult<()> {
        self.finished = true;
        if let Err(err) = self.connection.commit(self.savepoint.as_ref()) {
            self.rollback_quietly();
            self.restore_quietly();
            return Err(OrmError::transaction(
                "Could not commit",
                self.savepoint_name(),
                err,
            ));
        }
        debug!(savepoint = %self.savepoint_name(), "Committed transaction");
        self.restore()
    }

    fn rollback(mut self) {
        self.finished = true;
        self.rollback_quietly();
        self.restore_quietly();
    }

    fn rollback_quietly(&self) {
        match self.connection.rollback(self.savepoint.as_ref()) {
            Ok(()) => debug!(savepoint = %self.savepoint_name(), "Rolled back transaction"),
            Err(err) => error!(
                savepoint = %self.savepoint_name(),
                error = %err,
                "Failed to roll back transaction"
            ),
        }
    }

    fn restore(&mut self) -> OrmResult<()> {
        if !self.restore_auto_commit {
            return Ok(());
        }
        self.restore_auto_commit = false;
        self.connection.set_auto_commit(true)?;
        debug!("Restored autocommit");
        Ok(())
    }

    fn restore_quietly(&mut self) {
        if let Err(err) = self.restore() {
            error!(error = %err, "Failed to restore autocommit");
        }
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            savepoint = %self.savepoint_name(),
            "Transaction abandoned during unwind, rolling back"
        );
        self.rollback_quietly();
        self.restore_quietly();
    }
}
