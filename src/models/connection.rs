//! Connection-related data models.

use serde::{Deserialize, Serialize};

/// Database dialect reported by a connection source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Quote a table or column name.
    pub fn escape_identifier(&self, name: &str) -> String {
        match self {
            Self::MySQL => format!("`{}`", name.replace('`', "``")),
            Self::PostgreSQL | Self::SQLite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Bind placeholder for the parameter at `index` (zero based).
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${}", index + 1),
            Self::MySQL | Self::SQLite => "?".to_string(),
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
