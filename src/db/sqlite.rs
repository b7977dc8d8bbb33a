//! SQLite connection source backed by an sqlx pool.
//!
//! The public API is blocking. Each source owns a small multi-thread tokio
//! runtime and drives sqlx futures with [`Handle::block_on`], so callers must
//! not use it from inside an async task.
//!
//! Autocommit is emulated: turning it off issues `BEGIN`, turning it back on
//! while a transaction is open issues `COMMIT`.

use crate::config::{ConfigError, SourceConfig};
use crate::db::params::bind_sqlite_param;
use crate::db::types::RowToJson;
use crate::db::{
    ConnectionSource, DatabaseConnection, PinOutcome, Row, Savepoint, SpecialConnection,
};
use crate::error::{OrmError, OrmResult};
use crate::models::{DatabaseType, SqlValue};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

struct ConnState {
    conn: Option<PoolConnection<Sqlite>>,
    auto_commit: bool,
}

impl ConnState {
    fn connection(&mut self) -> OrmResult<&mut PoolConnection<Sqlite>> {
        self.conn
            .as_mut()
            .ok_or_else(|| OrmError::illegal_state("Connection has already been closed"))
    }
}

/// One pooled SQLite connection.
pub struct SqliteDatabaseConnection {
    handle: Handle,
    state: Mutex<ConnState>,
}

impl SqliteDatabaseConnection {
    fn new(handle: Handle, conn: PoolConnection<Sqlite>) -> Self {
        Self {
            handle,
            state: Mutex::new(ConnState {
                conn: Some(conn),
                auto_commit: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, state: &mut ConnState, sql: &str) -> OrmResult<()> {
        let conn = state.connection()?;
        self.handle
            .block_on(sqlx::query(sql).persistent(false).execute(&mut **conn))?;
        debug!(sql = %sql, "Executed control statement");
        Ok(())
    }

    fn savepoint_identifier(savepoint: &Savepoint) -> String {
        DatabaseType::SQLite.escape_identifier(savepoint.name())
    }

    /// Return the pooled connection. Must run inside the runtime context.
    fn return_to_pool(&self, conn: PoolConnection<Sqlite>) {
        let _guard = self.handle.enter();
        drop(conn);
    }
}

impl DatabaseConnection for SqliteDatabaseConnection {
    fn is_auto_commit_supported(&self) -> OrmResult<bool> {
        Ok(true)
    }

    fn is_auto_commit(&self) -> OrmResult<bool> {
        Ok(self.lock().auto_commit)
    }

    fn set_auto_commit(&self, auto_commit: bool) -> OrmResult<()> {
        let mut state = self.lock();
        match (state.auto_commit, auto_commit) {
            (true, false) => self.run(&mut state, "BEGIN")?,
            (false, true) => self.run(&mut state, "COMMIT")?,
            _ => return Ok(()),
        }
        state.auto_commit = auto_commit;
        Ok(())
    }

    fn set_savepoint(&self, name: &str) -> OrmResult<Option<Savepoint>> {
        let savepoint = Savepoint::new(name);
        let mut state = self.lock();
        self.run(
            &mut state,
            &format!("SAVEPOINT {}", Self::savepoint_identifier(&savepoint)),
        )?;
        Ok(Some(savepoint))
    }

    fn commit(&self, savepoint: Option<&Savepoint>) -> OrmResult<()> {
        let mut state = self.lock();
        match savepoint {
            Some(sp) => self.run(
                &mut state,
                &format!("RELEASE SAVEPOINT {}", Self::savepoint_identifier(sp)),
            ),
            None if state.auto_commit => Err(OrmError::illegal_state(
                "Cannot commit while autocommit is enabled",
            )),
            None => {
                // Autocommit stays off, so a new transaction starts right away.
                self.run(&mut state, "COMMIT")?;
                self.run(&mut state, "BEGIN")
            }
        }
    }

    fn rollback(&self, savepoint: Option<&Savepoint>) -> OrmResult<()> {
        let mut state = self.lock();
        match savepoint {
            Some(sp) => {
                let ident = Self::savepoint_identifier(sp);
                self.run(&mut state, &format!("ROLLBACK TO SAVEPOINT {ident}"))?;
                self.run(&mut state, &format!("RELEASE SAVEPOINT {ident}"))
            }
            None if state.auto_commit => Err(OrmError::illegal_state(
                "Cannot roll back while autocommit is enabled",
            )),
            None => {
                self.run(&mut state, "ROLLBACK")?;
                self.run(&mut state, "BEGIN")
            }
        }
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> OrmResult<u64> {
        let mut state = self.lock();
        let conn = state.connection()?;
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_sqlite_param(query, arg);
        }
        let result = self.handle.block_on(query.execute(&mut **conn))?;
        Ok(result.rows_affected())
    }

    fn query_for_one(&self, sql: &str, args: &[SqlValue]) -> OrmResult<Option<Row>> {
        let mut state = self.lock();
        let conn = state.connection()?;
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_sqlite_param(query, arg);
        }
        let row = self.handle.block_on(query.fetch_optional(&mut **conn))?;
        Ok(row.map(|r| r.to_json_map()))
    }

    fn close(&self) -> OrmResult<()> {
        let conn = self.lock().conn.take();
        match conn {
            Some(conn) => {
                self.return_to_pool(conn);
                Ok(())
            }
            None => Err(OrmError::illegal_state("Connection has already been closed")),
        }
    }
}

impl Drop for SqliteDatabaseConnection {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = state.conn.take() {
            if !state.auto_commit {
                warn!("Connection dropped with an open transaction");
            }
            self.return_to_pool(conn);
        }
    }
}

/// Connection source for one SQLite database.
pub struct SqliteConnectionSource {
    special: SpecialConnection,
    pool: Option<SqlitePool>,
    runtime: Runtime,
}

impl SqliteConnectionSource {
    /// Open a pool for the configured database, creating the file if missing.
    pub fn open(config: &SourceConfig) -> OrmResult<Self> {
        if config.db_type != DatabaseType::SQLite {
            return Err(ConfigError::Unsupported(config.db_type).into());
        }
        let pool_opts = &config.pool_options;
        pool_opts.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ormcore-sqlite")
            .enable_all()
            .build()
            .map_err(|e| OrmError::internal(format!("Failed to start runtime: {}", e)))?;

        let options = SqliteConnectOptions::from_str(&config.connection_string)
            .map_err(|e| {
                OrmError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
            .create_if_missing(true);

        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .min_connections(pool_opts.min_connections_or_default())
                    .max_connections(pool_opts.max_connections_or_default())
                    .acquire_timeout(pool_opts.acquire_timeout())
                    .idle_timeout(pool_opts.idle_timeout())
                    .connect_with(options),
            )
            .map_err(|e| {
                OrmError::connection(
                    format!("Failed to connect: {}", e),
                    "Check that the database file path exists and is writable",
                )
            })?;

        info!(
            connection_string = %config.connection_string,
            max_connections = pool_opts.max_connections_or_default(),
            "Opened SQLite connection source"
        );

        Ok(Self {
            special: SpecialConnection::new(),
            pool: Some(pool),
            runtime,
        })
    }

    /// Parse `url` and open it.
    pub fn connect(url: &str) -> OrmResult<Self> {
        Self::open(&SourceConfig::parse(url)?)
    }

    /// Stop handing out connections and wait for outstanding ones to return.
    pub fn close(&self) {
        if let Some(pool) = &self.pool {
            self.runtime.block_on(pool.close());
        }
    }

    fn pool(&self) -> OrmResult<&SqlitePool> {
        self.pool
            .as_ref()
            .ok_or_else(|| OrmError::connection("Connection pool is closed", "Reopen the source"))
    }
}

impl ConnectionSource for SqliteConnectionSource {
    fn get_read_write_connection(&self) -> OrmResult<Arc<dyn DatabaseConnection>> {
        if let Some(special) = self.special.get() {
            return Ok(special);
        }
        let conn = self.runtime.block_on(self.pool()?.acquire())?;
        Ok(Arc::new(SqliteDatabaseConnection::new(
            self.runtime.handle().clone(),
            conn,
        )))
    }

    fn release_connection(&self, connection: &Arc<dyn DatabaseConnection>) -> OrmResult<()> {
        if self.special.is_special(connection) {
            return Ok(());
        }
        connection.close()
    }

    fn save_special_connection(
        &self,
        connection: &Arc<dyn DatabaseConnection>,
    ) -> OrmResult<PinOutcome> {
        self.special.save(connection)
    }

    fn clear_special_connection(&self, connection: &Arc<dyn DatabaseConnection>) {
        self.special.clear(connection);
    }

    fn special_connection(&self) -> Option<Arc<dyn DatabaseConnection>> {
        self.special.get()
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

impl Drop for SqliteConnectionSource {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        if let Some(pinned) = self.special.get() {
            warn!("Connection source dropped while a connection is pinned");
            self.special.clear(&pinned);
        }
        drop(self.pool.take());
    }
}
