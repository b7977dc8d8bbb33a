//! Error types for the persistence runtime.
//!
//! This module defines all error types using `thiserror`. Construction and
//! transaction failures keep their original cause reachable through
//! [`std::error::Error::source`].

use thiserror::Error;

/// Boxed cause carried by wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error("Could not construct DAO {dao} for {entity}: {source}")]
    Construction {
        dao: String,
        entity: String,
        #[source]
        source: BoxError,
    },

    #[error("DAO {dao} for {entity} has no usable constructor")]
    MissingConstructor { dao: String, entity: String },

    #[error("DAO registered for {entity} is a {actual}, not a {expected}")]
    DaoTypeMismatch {
        entity: String,
        expected: String,
        actual: String,
    },

    #[error("Transaction error: {message} (savepoint: {savepoint})")]
    Transaction {
        message: String,
        savepoint: String,
        #[source]
        source: Box<OrmError>,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "2067" for a SQLite unique constraint violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Mapping error: {message}")]
    Mapping { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl OrmError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Wrap the failure a DAO constructor reported.
    pub fn construction(
        dao: impl Into<String>,
        entity: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Construction {
            dao: dao.into(),
            entity: entity.into(),
            source: source.into(),
        }
    }

    pub fn missing_constructor(dao: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::MissingConstructor {
            dao: dao.into(),
            entity: entity.into(),
        }
    }

    pub fn dao_type_mismatch(
        entity: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DaoTypeMismatch {
            entity: entity.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a transaction error wrapping the failed savepoint operation.
    pub fn transaction(
        message: impl Into<String>,
        savepoint: impl Into<String>,
        source: OrmError,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            savepoint: savepoint.into(),
            source: Box::new(source),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Transaction { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True for every way a DAO can fail to come into existence.
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            Self::Construction { .. } | Self::MissingConstructor { .. }
        )
    }
}

/// Convert sqlx errors to OrmError.
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => OrmError::connection(
                msg.to_string(),
                "Check the connection string format and file path",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                OrmError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => OrmError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => OrmError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                OrmError::connection("Connection pool is closed", "Reopen the connection source")
            }
            sqlx::Error::Io(io_err) => OrmError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file is reachable and writable",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                OrmError::mapping(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                OrmError::mapping(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => OrmError::mapping(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => OrmError::internal("Database worker crashed"),
            _ => OrmError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::mapping(err.to_string())
    }
}

/// Result type alias for persistence operations.
pub type OrmResult<T> = Result<T, OrmError>;
