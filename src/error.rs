//! Error types for tenant-db.
//!
//! Every layer (adapters, manager, façade, resolver, orchestrator) reports
//! through [`DbError`]. Driver errors keep their original message; callers
//! above the façade see a single causally-chained message.

use thiserror::Error;

/// Longest SQL excerpt carried inside a [`DbError::Query`].
pub const SQL_EXCERPT_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum DbError {
    /// Missing or invalid configuration value, or an unsupported driver.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection pool not initialized: call initialize() first")]
    PoolNotInitialized,

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed on database '{database}': {message} (sql: {sql})")]
    Query {
        message: String,
        database: String,
        /// Truncated to [`SQL_EXCERPT_LEN`] characters.
        sql: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Transaction failed on database '{database}': {source}")]
    Transaction {
        database: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Tenant resolution failed for email {email}: {message}")]
    TenantResolution { email: String, message: String },

    #[error("Migration '{script}' failed: {message}")]
    Migration { script: String, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// A driver error surfaced unmodified by an adapter.
    #[error("{message}")]
    Driver {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Wrap an error raised while executing `sql` against `database`.
    ///
    /// Connection and timeout errors pass through untouched so that
    /// `is_retryable` keeps working above the façade.
    pub fn query(err: DbError, database: impl Into<String>, sql: &str) -> Self {
        match err {
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolNotInitialized => err,
            Self::Driver { message, sql_state } => Self::Query {
                message,
                database: database.into(),
                sql: truncate_sql(sql),
                sql_state,
            },
            other => Self::Query {
                message: other.to_string(),
                database: database.into(),
                sql: truncate_sql(sql),
                sql_state: None,
            },
        }
    }

    /// Wrap the error a transaction callback produced.
    pub fn transaction(database: impl Into<String>, source: DbError) -> Self {
        Self::Transaction {
            database: database.into(),
            source: Box::new(source),
        }
    }

    /// Create a tenant resolution error.
    pub fn tenant_resolution(email: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TenantResolution {
            email: email.into(),
            message: message.into(),
        }
    }

    /// Create a migration error for a named script.
    pub fn migration(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a driver error carrying the driver's own message.
    pub fn driver(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state,
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
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Shorten SQL for inclusion in error messages and logs.
pub fn truncate_sql(sql: &str) -> String {
    let trimmed = sql.trim();
    if trimmed.chars().count() <= SQL_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let mut excerpt: String = trimmed.chars().take(SQL_EXCERPT_LEN).collect();
    excerpt.push_str("...");
    excerpt
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the host, port, credentials and database name",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::driver(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::driver("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Re-initialize the manager")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify the ssl setting and server certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::driver(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            other => DbError::driver(other.to_string(), None),
        }
    }
}

/// Convert SQL Server driver errors to DbError.
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error as TdsError;
        match err {
            TdsError::Server(token) => {
                DbError::driver(token.message().to_string(), Some(token.code().to_string()))
            }
            TdsError::Io { kind, message } => DbError::connection(
                format!("I/O error ({:?}): {}", kind, message),
                "Check network connectivity and database server status",
            ),
            TdsError::Tls(message) => DbError::connection(
                format!("TLS error: {}", message),
                "Verify the ssl setting and server certificates",
            ),
            TdsError::Routing { host, port } => DbError::connection(
                format!("Server requested routing to {}:{}", host, port),
                "Connect to the routed host directly",
            ),
            other => DbError::driver(other.to_string(), None),
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::connection(
            format!("I/O error: {}", err),
            "Check network connectivity and file permissions",
        )
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
        assert!(!DbError::PoolNotInitialized.is_retryable());
    }

    #[test]
    fn test_query_error_keeps_driver_message_and_database() {
        let err = DbError::query(
            DbError::driver("no such table: todos", None),
            "tenant_a",
            "SELECT * FROM todos",
        );
        let msg = err.to_string();
        assert!(msg.contains("no such table: todos"));
        assert!(msg.contains("tenant_a"));
        assert!(msg.contains("SELECT * FROM todos"));
    }

    #[test]
    fn test_query_error_passes_connection_errors_through() {
        let err = DbError::query(DbError::connection("refused", "start it"), "db", "SELECT 1");
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_truncate_sql() {
        let long = "SELECT ".to_string() + &"x, ".repeat(200);
        let excerpt = truncate_sql(&long);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.chars().count(), SQL_EXCERPT_LEN + 3);
        assert_eq!(truncate_sql("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn test_transaction_error_chains_cause() {
        let err = DbError::transaction("master", DbError::invalid_input("boom"));
        let msg = err.to_string();
        assert!(msg.contains("master"));
        assert!(msg.contains("boom"));
    }
}
