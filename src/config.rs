//! Connection source configuration.
//!
//! Pool options can be supplied directly or as query parameters of a
//! connection URL; driver options in the same URL are passed through.

use crate::error::OrmError;
use crate::models::DatabaseType;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Errors raised while parsing or validating a source configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),

    #[error("Unsupported database type: {0}")]
    Unsupported(DatabaseType),

    #[error("Invalid pool option: {0}")]
    InvalidPoolOption(String),
}

impl From<ConfigError> for OrmError {
    fn from(err: ConfigError) -> Self {
        OrmError::invalid_argument(err.to_string())
    }
}

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 4)
    pub max_connections: Option<u32>,
    /// Connections kept open while idle (default: 0)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
}

impl PoolOptions {
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    /// Validate pool options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidPoolOption(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_connections, self.max_connections) {
            if min > max {
                return Err(ConfigError::InvalidPoolOption(format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to open a connection source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub db_type: DatabaseType,
    /// Driver connection string with pool options stripped.
    pub connection_string: String,
    pub pool_options: PoolOptions,
}

impl SourceConfig {
    /// Pool option keys extracted from URL query parameters.
    const POOL_OPTION_KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
    ];

    /// Parse a connection URL such as `sqlite:data.db?max_connections=2`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let db_type = DatabaseType::from_connection_string(s)
            .ok_or_else(|| ConfigError::UnknownDatabaseType(s.to_string()))?;

        let mut url = Url::parse(s).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        let mut opts = Self::extract_options(&mut url, Self::POOL_OPTION_KEYS);
        let pool_options = Self::parse_pool_options(&mut opts)?;
        pool_options.validate()?;

        Ok(Self {
            db_type,
            connection_string: url.to_string(),
            pool_options,
        })
    }

    /// Configuration for a SQLite database file, created if missing.
    pub fn sqlite_file(path: impl AsRef<Path>) -> Self {
        Self {
            db_type: DatabaseType::SQLite,
            connection_string: format!("sqlite://{}", path.as_ref().display()),
            pool_options: PoolOptions::default(),
        }
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    fn parse_pool_options(opts: &mut HashMap<String, String>) -> Result<PoolOptions, ConfigError> {
        fn number<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
            value
                .map(|v| {
                    v.parse().map_err(|_| {
                        ConfigError::InvalidPoolOption(format!("{key} must be a number, got '{v}'"))
                    })
                })
                .transpose()
        }

        Ok(PoolOptions {
            max_connections: number("max_connections", opts.remove("max_connections"))?,
            min_connections: number("min_connections", opts.remove("min_connections"))?,
            idle_timeout_secs: number("idle_timeout", opts.remove("idle_timeout"))?,
            acquire_timeout_secs: number("acquire_timeout", opts.remove("acquire_timeout"))?,
        })
    }

    /// Extract pool options from URL query params, keeping others for the driver.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}
