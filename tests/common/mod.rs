//! Shared fakes for integration tests.
//!
//! `RecordingConnection` and `RecordingSource` log every capability call in
//! order so tests can assert on the exact transaction protocol.

#![allow(dead_code)]

use ormcore::db::{
    ConnectionSource, DatabaseConnection, PinOutcome, Row, Savepoint, SpecialConnection,
};
use ormcore::error::{OrmError, OrmResult};
use ormcore::models::{DatabaseType, SqlValue};
use std::sync::{Arc, Mutex};

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetConnection,
    Release,
    Pin,
    Unpin,
    IsAutoCommitSupported,
    IsAutoCommit,
    SetAutoCommit(bool),
    SetSavepoint,
    /// `true` when a savepoint was passed
    Commit(bool),
    Rollback(bool),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

fn record(log: &CallLog, call: Call) {
    log.lock().unwrap().push(call);
}

fn injected(what: &str) -> OrmError {
    OrmError::database(format!("injected {what} failure"), None, "none")
}

/// A connection whose capabilities are set up per test.
pub struct RecordingConnection {
    log: CallLog,
    auto_commit_supported: bool,
    auto_commit: Mutex<bool>,
    savepoints: bool,
    fail_savepoint: bool,
    fail_commit: bool,
    fail_rollback: bool,
    savepoint_names: Mutex<Vec<String>>,
}

impl RecordingConnection {
    /// Savepoints supported, autocommit not.
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: Arc::clone(log),
            auto_commit_supported: false,
            auto_commit: Mutex::new(false),
            savepoints: true,
            fail_savepoint: false,
            fail_commit: false,
            fail_rollback: false,
            savepoint_names: Mutex::new(Vec::new()),
        }
    }

    pub fn with_auto_commit(mut self, currently_on: bool) -> Self {
        self.auto_commit_supported = true;
        self.auto_commit = Mutex::new(currently_on);
        self
    }

    pub fn without_savepoints(mut self) -> Self {
        self.savepoints = false;
        self
    }

    pub fn failing_savepoint(mut self) -> Self {
        self.fail_savepoint = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn auto_commit(&self) -> bool {
        *self.auto_commit.lock().unwrap()
    }

    pub fn savepoint_names(&self) -> Vec<String> {
        self.savepoint_names.lock().unwrap().clone()
    }
}

impl DatabaseConnection for RecordingConnection {
    fn is_auto_commit_supported(&self) -> OrmResult<bool> {
        record(&self.log, Call::IsAutoCommitSupported);
        Ok(self.auto_commit_supported)
    }

    fn is_auto_commit(&self) -> OrmResult<bool> {
        record(&self.log, Call::IsAutoCommit);
        Ok(self.auto_commit())
    }

    fn set_auto_commit(&self, auto_commit: bool) -> OrmResult<()> {
        record(&self.log, Call::SetAutoCommit(auto_commit));
        *self.auto_commit.lock().unwrap() = auto_commit;
        Ok(())
    }

    fn set_savepoint(&self, name: &str) -> OrmResult<Option<Savepoint>> {
        record(&self.log, Call::SetSavepoint);
        if self.fail_savepoint {
            return Err(injected("savepoint"));
        }
        self.savepoint_names.lock().unwrap().push(name.to_string());
        Ok(self.savepoints.then(|| Savepoint::new(name)))
    }

    fn commit(&self, savepoint: Option<&Savepoint>) -> OrmResult<()> {
        record(&self.log, Call::Commit(savepoint.is_some()));
        if self.fail_commit {
            return Err(injected("commit"));
        }
        Ok(())
    }

    fn rollback(&self, savepoint: Option<&Savepoint>) -> OrmResult<()> {
        record(&self.log, Call::Rollback(savepoint.is_some()));
        if self.fail_rollback {
            return Err(injected("rollback"));
        }
        Ok(())
    }

    fn execute(&self, _sql: &str, _args: &[SqlValue]) -> OrmResult<u64> {
        Ok(0)
    }

    fn query_for_one(&self, _sql: &str, _args: &[SqlValue]) -> OrmResult<Option<Row>> {
        Ok(None)
    }

    fn close(&self) -> OrmResult<()> {
        Ok(())
    }
}

/// A source handing out one recording connection.
pub struct RecordingSource {
    log: CallLog,
    connection: Arc<dyn DatabaseConnection>,
    special: SpecialConnection,
    fail_acquire: bool,
}

impl RecordingSource {
    pub fn new(log: &CallLog, connection: Arc<RecordingConnection>) -> Self {
        Self {
            log: Arc::clone(log),
            connection,
            special: SpecialConnection::new(),
            fail_acquire: false,
        }
    }

    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    pub fn is_pinned(&self) -> bool {
        self.special.get().is_some()
    }
}

impl ConnectionSource for RecordingSource {
    fn get_read_write_connection(&self) -> OrmResult<Arc<dyn DatabaseConnection>> {
        record(&self.log, Call::GetConnection);
        if self.fail_acquire {
            return Err(OrmError::connection("injected acquire failure", "none"));
        }
        Ok(self
            .special
            .get()
            .unwrap_or_else(|| Arc::clone(&self.connection)))
    }

    fn release_connection(&self, _connection: &Arc<dyn DatabaseConnection>) -> OrmResult<()> {
        record(&self.log, Call::Release);
        Ok(())
    }

    fn save_special_connection(
        &self,
        connection: &Arc<dyn DatabaseConnection>,
    ) -> OrmResult<PinOutcome> {
        record(&self.log, Call::Pin);
        self.special.save(connection)
    }

    fn clear_special_connection(&self, connection: &Arc<dyn DatabaseConnection>) {
        record(&self.log, Call::Unpin);
        self.special.clear(connection);
    }

    fn special_connection(&self) -> Option<Arc<dyn DatabaseConnection>> {
        self.special.get()
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

/// A source that never hands out connections; enough for DAO construction.
pub struct NoopSource;

impl ConnectionSource for NoopSource {
    fn get_read_write_connection(&self) -> OrmResult<Arc<dyn DatabaseConnection>> {
        Err(OrmError::illegal_state("NoopSource has no connections"))
    }

    fn release_connection(&self, _connection: &Arc<dyn DatabaseConnection>) -> OrmResult<()> {
        Ok(())
    }

    fn save_special_connection(
        &self,
        _connection: &Arc<dyn DatabaseConnection>,
    ) -> OrmResult<PinOutcome> {
        Err(OrmError::illegal_state("NoopSource cannot pin"))
    }

    fn clear_special_connection(&self, _connection: &Arc<dyn DatabaseConnection>) {}

    fn special_connection(&self) -> Option<Arc<dyn DatabaseConnection>> {
        None
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

pub fn noop_source() -> Arc<dyn ConnectionSource> {
    Arc::new(NoopSource)
}
