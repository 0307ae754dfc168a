//! Engine-specific SQL text.
//!
//! Everything the façade, resolver and orchestrator need to phrase portable
//! statements: placeholder syntax, identifier quoting, transaction verbs and
//! the DDL for tracking tables and databases.

use crate::error::{DbError, DbResult};
use crate::models::DriverKind;

/// SQL phrasing for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    driver: DriverKind,
}

impl Dialect {
    pub fn new(driver: DriverKind) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self.driver {
            DriverKind::MySql | DriverKind::Sqlite => "?".to_string(),
            DriverKind::Postgres => format!("${}", index),
            DriverKind::MsSql => format!("@P{}", index),
        }
    }

    /// Rewrite `?` placeholders into this engine's syntax.
    ///
    /// Question marks inside quoted strings or identifiers are left alone.
    pub fn render(&self, sql: &str) -> String {
        if matches!(self.driver, DriverKind::MySql | DriverKind::Sqlite) {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut quote: Option<char> = None;
        let mut index = 0;
        for c in sql.chars() {
            match (quote, c) {
                (None, '\'' | '"' | '`') => {
                    quote = Some(c);
                    out.push(c);
                }
                (None, '[') => {
                    quote = Some(']');
                    out.push(c);
                }
                (Some(q), _) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (None, '?') => {
                    index += 1;
                    out.push_str(&self.placeholder(index));
                }
                _ => out.push(c),
            }
        }
        out
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_ident(&self, name: &str) -> String {
        match self.driver {
            DriverKind::MySql => format!("`{}`", name.replace('`', "``")),
            DriverKind::Postgres | DriverKind::Sqlite => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            DriverKind::MsSql => format!("[{}]", name.replace(']', "]]")),
        }
    }

    pub fn begin_sql(&self) -> &'static str {
        match self.driver {
            DriverKind::MySql => "START TRANSACTION",
            DriverKind::Postgres | DriverKind::Sqlite => "BEGIN",
            DriverKind::MsSql => "BEGIN TRANSACTION",
        }
    }

    pub fn commit_sql(&self) -> &'static str {
        match self.driver {
            DriverKind::MsSql => "COMMIT TRANSACTION",
            _ => "COMMIT",
        }
    }

    pub fn rollback_sql(&self) -> &'static str {
        match self.driver {
            DriverKind::MsSql => "ROLLBACK TRANSACTION",
            _ => "ROLLBACK",
        }
    }

    /// Statement that switches a live session to `database`, if the engine
    /// supports it.
    pub fn use_database_sql(&self, database: &str) -> Option<String> {
        match self.driver {
            DriverKind::MySql | DriverKind::MsSql => {
                Some(format!("USE {}", self.quote_ident(database)))
            }
            DriverKind::Postgres | DriverKind::Sqlite => None,
        }
    }

    /// Column definition for an auto-incrementing integer primary key.
    pub fn auto_id_column(&self) -> &'static str {
        match self.driver {
            DriverKind::MySql => "id INT AUTO_INCREMENT PRIMARY KEY",
            DriverKind::Postgres => "id SERIAL PRIMARY KEY",
            DriverKind::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            DriverKind::MsSql => "id INT IDENTITY(1,1) PRIMARY KEY",
        }
    }

    pub fn timestamp_type(&self) -> &'static str {
        match self.driver {
            DriverKind::MsSql => "DATETIME2",
            _ => "TIMESTAMP",
        }
    }

    /// `CREATE TABLE` that is a no-op when the table already exists.
    pub fn create_table_sql(&self, table: &str, columns: &[String]) -> String {
        let body = columns.join(", ");
        match self.driver {
            DriverKind::MsSql => format!(
                "IF OBJECT_ID(N'{}', N'U') IS NULL CREATE TABLE {} ({})",
                table.replace('\'', "''"),
                self.quote_ident(table),
                body
            ),
            _ => format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                self.quote_ident(table),
                body
            ),
        }
    }

    /// `CREATE INDEX` that is a no-op when the index already exists.
    ///
    /// MySQL has no conditional form, so its statement is unconditional and
    /// callers check `information_schema.statistics` first.
    pub fn create_index_sql(&self, index: &str, table: &str, column: &str) -> String {
        match self.driver {
            DriverKind::MySql => format!(
                "CREATE INDEX {} ON {} ({})",
                self.quote_ident(index),
                self.quote_ident(table),
                self.quote_ident(column)
            ),
            DriverKind::MsSql => format!(
                "IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = N'{}' AND object_id = OBJECT_ID(N'{}')) \
                 CREATE INDEX {} ON {} ({})",
                index.replace('\'', "''"),
                table.replace('\'', "''"),
                self.quote_ident(index),
                self.quote_ident(table),
                self.quote_ident(column)
            ),
            DriverKind::Postgres | DriverKind::Sqlite => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                self.quote_ident(index),
                self.quote_ident(table),
                self.quote_ident(column)
            ),
        }
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_ident(table))
    }

    /// DDL of a tracking table (`migrations` or `seeds`).
    pub fn tracking_table_sql(&self, table: &str) -> String {
        self.create_table_sql(
            table,
            &[
                self.auto_id_column().to_string(),
                "name VARCHAR(255) NOT NULL UNIQUE".to_string(),
                format!(
                    "applied_at {} DEFAULT CURRENT_TIMESTAMP",
                    self.timestamp_type()
                ),
            ],
        )
    }

    /// Create-if-absent statement for a server database.
    ///
    /// PostgreSQL has no conditional form and SQLite has no server databases,
    /// so both return `None`; their adapters handle creation themselves.
    pub fn create_database_sql(&self, database: &str) -> Option<String> {
        match self.driver {
            DriverKind::MySql => Some(format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                self.quote_ident(database)
            )),
            DriverKind::MsSql => Some(format!(
                "IF DB_ID(N'{}') IS NULL CREATE DATABASE {}",
                database.replace('\'', "''"),
                self.quote_ident(database)
            )),
            DriverKind::Postgres | DriverKind::Sqlite => None,
        }
    }

    pub fn drop_database_sql(&self, database: &str) -> Option<String> {
        match self.driver {
            DriverKind::MySql | DriverKind::Postgres => Some(format!(
                "DROP DATABASE IF EXISTS {}",
                self.quote_ident(database)
            )),
            DriverKind::MsSql => Some(format!(
                "IF DB_ID(N'{}') IS NOT NULL DROP DATABASE {}",
                database.replace('\'', "''"),
                self.quote_ident(database)
            )),
            DriverKind::Sqlite => None,
        }
    }
}

/// Reject database names that cannot be safely interpolated into DDL.
pub fn validate_database_name(name: &str) -> DbResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(DbError::invalid_input(format!(
            "invalid database name '{}': must be 1-128 characters",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'))
    {
        return Err(DbError::invalid_input(format!(
            "invalid database name '{}': only letters, digits, '_', '-' and '$' are allowed",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let sql = "SELECT * FROM tenant_users WHERE email = ? AND tenant_id = ?";
        assert_eq!(
            Dialect::new(DriverKind::Postgres).render(sql),
            "SELECT * FROM tenant_users WHERE email = $1 AND tenant_id = $2"
        );
        assert_eq!(
            Dialect::new(DriverKind::MsSql).render(sql),
            "SELECT * FROM tenant_users WHERE email = @P1 AND tenant_id = @P2"
        );
        assert_eq!(Dialect::new(DriverKind::MySql).render(sql), sql);
    }

    #[test]
    fn test_render_skips_quoted_question_marks() {
        let sql = "SELECT '?' AS q, \"a?\" FROM t WHERE x = ?";
        assert_eq!(
            Dialect::new(DriverKind::Postgres).render(sql),
            "SELECT '?' AS q, \"a?\" FROM t WHERE x = $1"
        );
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(Dialect::new(DriverKind::MySql).quote_ident("a`b"), "`a``b`");
        assert_eq!(
            Dialect::new(DriverKind::Postgres).quote_ident("a\"b"),
            "\"a\"\"b\""
        );
        assert_eq!(Dialect::new(DriverKind::MsSql).quote_ident("a]b"), "[a]]b]");
    }

    #[test]
    fn test_transaction_verbs() {
        assert_eq!(Dialect::new(DriverKind::MySql).begin_sql(), "START TRANSACTION");
        assert_eq!(Dialect::new(DriverKind::Sqlite).begin_sql(), "BEGIN");
        assert_eq!(
            Dialect::new(DriverKind::MsSql).rollback_sql(),
            "ROLLBACK TRANSACTION"
        );
    }

    #[test]
    fn test_tracking_table_sql() {
        let sql = Dialect::new(DriverKind::Sqlite).tracking_table_sql("migrations");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"migrations\""));
        assert!(sql.contains("AUTOINCREMENT"));
        assert!(sql.contains("name VARCHAR(255) NOT NULL UNIQUE"));

        let sql = Dialect::new(DriverKind::MsSql).tracking_table_sql("seeds");
        assert!(sql.starts_with("IF OBJECT_ID(N'seeds', N'U') IS NULL"));
        assert!(sql.contains("DATETIME2"));
    }

    #[test]
    fn test_database_ddl() {
        let mysql = Dialect::new(DriverKind::MySql);
        assert_eq!(
            mysql.create_database_sql("acme").as_deref(),
            Some("CREATE DATABASE IF NOT EXISTS `acme`")
        );
        assert!(Dialect::new(DriverKind::Postgres)
            .create_database_sql("acme")
            .is_none());
        assert!(Dialect::new(DriverKind::Sqlite)
            .drop_database_sql("acme")
            .is_none());
        assert_eq!(
            mysql.use_database_sql("acme").as_deref(),
            Some("USE `acme`")
        );
        assert!(Dialect::new(DriverKind::Postgres)
            .use_database_sql("acme")
            .is_none());
    }

    #[test]
    fn test_create_index_sql() {
        assert_eq!(
            Dialect::new(DriverKind::Sqlite).create_index_sql("idx_u", "users", "email"),
            "CREATE INDEX IF NOT EXISTS \"idx_u\" ON \"users\" (\"email\")"
        );
        assert_eq!(
            Dialect::new(DriverKind::MySql).create_index_sql("idx_u", "users", "email"),
            "CREATE INDEX `idx_u` ON `users` (`email`)"
        );
        let mssql = Dialect::new(DriverKind::MsSql).create_index_sql("idx_u", "users", "email");
        assert!(mssql.starts_with("IF NOT EXISTS (SELECT 1 FROM sys.indexes WHERE name = N'idx_u'"));
        assert!(mssql.ends_with("CREATE INDEX [idx_u] ON [users] ([email])"));
    }

    #[test]
    fn test_validate_database_name() {
        assert!(validate_database_name("tenant_acme-01").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("x; DROP DATABASE y").is_err());
    }
}
