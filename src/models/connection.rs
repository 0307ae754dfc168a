//! Connection-related data models.
//!
//! This module defines the supported driver kinds and the immutable
//! [`DbConfig`] that backs the connection manager.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Includes MariaDB
    MySql,
    Postgres,
    /// Embedded, file-based engine without pooling.
    Sqlite,
    /// Microsoft SQL Server
    MsSql,
}

impl DriverKind {
    /// Parse the driver kind from a connection string scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        let scheme = lower.split(':').next()?;
        scheme.parse().ok()
    }

    /// Scheme used in connection descriptors.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::MsSql => "mssql",
        }
    }

    /// Get the display name for this driver kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
            Self::MsSql => "SQL Server",
        }
    }

    /// Get the default port for this driver kind.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::Postgres => Some(5432),
            Self::Sqlite => None,
            Self::MsSql => Some(1433),
        }
    }

    /// True for engines whose clients come from a shared pool.
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::MySql | Self::Postgres)
    }
}

impl FromStr for DriverKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mssql" | "sqlserver" => Ok(Self::MsSql),
            other => Err(DbError::configuration(format!(
                "unsupported driver: '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

/// Pool bounds shared by every engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLimits {
    /// Maximum live connections (MSSQL: maximum concurrent standalone clients).
    pub connection_limit: u32,
    /// How long a flow waits for a free connection.
    pub acquire_timeout: Duration,
    /// How long an unused pooled connection survives.
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            connection_limit: crate::config::DEFAULT_CONNECTION_LIMIT,
            acquire_timeout: Duration::from_secs(crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Connection settings for one physical database server.
///
/// Immutable once built; one instance backs the connection manager at a time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub driver: DriverKind,
    /// Server host. For SQLite this is unused.
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Default database. For SQLite this is the database file path.
    pub database: String,
    pub ssl: bool,
    pub pool: PoolLimits,
}

impl DbConfig {
    /// Create a config with default pool limits and the driver's default port.
    pub fn new(driver: DriverKind, host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            driver,
            host: host.into(),
            port: driver.default_port().unwrap_or(0),
            user: String::new(),
            password: None,
            database: database.into(),
            ssl: false,
            pool: PoolLimits::default(),
        }
    }

    /// Config for an on-disk SQLite database.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new(DriverKind::Sqlite, "", path)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = user.into();
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_pool(mut self, pool: PoolLimits) -> Self {
        self.pool = pool;
        self
    }

    /// Validate the config and return an error naming the offending field.
    pub fn validate(&self) -> DbResult<()> {
        if self.driver != DriverKind::Sqlite {
            if self.host.trim().is_empty() {
                return Err(DbError::configuration(format!(
                    "host is required for the {} driver",
                    self.driver
                )));
            }
            if self.port == 0 {
                return Err(DbError::configuration("port must be greater than 0"));
            }
        } else if self.database.trim().is_empty() {
            return Err(DbError::configuration(
                "SQLite requires a database file path",
            ));
        }
        if self.pool.connection_limit == 0 {
            return Err(DbError::configuration(
                "connection limit must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get a display-safe connection descriptor (password masked).
    pub fn masked_descriptor(&self) -> String {
        let password = if self.password.is_some() { ":****" } else { "" };
        format!(
            "{}://{}{}@{}:{}/{}",
            self.driver.scheme(),
            self.user,
            password,
            self.host,
            self.port,
            self.database
        )
    }
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_aliases() {
        assert_eq!("mariadb".parse::<DriverKind>().unwrap(), DriverKind::MySql);
        assert_eq!("PG".parse::<DriverKind>().unwrap(), DriverKind::Postgres);
        assert_eq!("sqlite3".parse::<DriverKind>().unwrap(), DriverKind::Sqlite);
        assert_eq!("sqlserver".parse::<DriverKind>().unwrap(), DriverKind::MsSql);
    }

    #[test]
    fn test_unsupported_driver() {
        let err = "oracle".parse::<DriverKind>().unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(err.to_string().contains("unsupported driver"));
    }

    #[test]
    fn test_driver_kind_from_connection_string() {
        assert_eq!(
            DriverKind::from_connection_string("postgresql://localhost/db"),
            Some(DriverKind::Postgres)
        );
        assert_eq!(
            DriverKind::from_connection_string("mssql://sa@host:1433/db"),
            Some(DriverKind::MsSql)
        );
        assert_eq!(
            DriverKind::from_connection_string("sqlite:data/app.sqlite"),
            Some(DriverKind::Sqlite)
        );
        assert_eq!(DriverKind::from_connection_string("unknown://x"), None);
    }

    #[test]
    fn test_validate_requires_host_for_servers() {
        let cfg = DbConfig::new(DriverKind::MySql, "", "app");
        assert!(cfg.validate().is_err());
        let cfg = DbConfig::new(DriverKind::MySql, "localhost", "app");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_sqlite_needs_path() {
        assert!(DbConfig::sqlite("").validate().is_err());
        assert!(DbConfig::sqlite("data/app.sqlite").validate().is_ok());
    }

    #[test]
    fn test_debug_masks_password() {
        let cfg = DbConfig::new(DriverKind::Postgres, "db", "app")
            .with_credentials("admin", Some("hunter2".to_string()));
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("hunter2"));
        assert!(cfg.masked_descriptor().contains(":****@"));
    }

    #[test]
    fn test_empty_password_is_absent() {
        let cfg = DbConfig::new(DriverKind::Postgres, "db", "app")
            .with_credentials("admin", Some(String::new()));
        assert!(cfg.password.is_none());
    }
}
