//! SQLite adapter.
//!
//! SQLite is embedded, so there is no pool: `init_pool` only makes sure the
//! configured file exists, and every checkout opens one standalone
//! connection that `end()` closes. The configured database is a file path;
//! other database names map to files in the same directory
//! (`<dir>/<name>.sqlite`). Checkouts never create files, only
//! `create_database` does.

use crate::db::adapter::{AdapterClient, ClientConnection, DriverAdapter, HandleKind, checkout};
use crate::db::connection_suggestion;
use crate::db::mysql::collapse;
use crate::db::params::bind_sqlite_param;
use crate::db::statement::{StatementInfo, analyze};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind, QueryParam, RawResult, Row};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Either};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FILE_EXTENSIONS: [&str; 3] = [".db", ".sqlite", ".sqlite3"];

pub struct SqliteAdapter {
    config: DbConfig,
}

impl SqliteAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }

    /// File backing `database`.
    ///
    /// Empty or the configured name selects the configured file. Names that
    /// look like paths (a separator or a known extension) are used as given.
    pub fn resolve_path(&self, database: &str) -> PathBuf {
        let default = Path::new(&self.config.database);
        if database.is_empty() || database == self.config.database {
            return default.to_path_buf();
        }
        let looks_like_path = database.contains('/')
            || database.contains('\\')
            || database == ":memory:"
            || FILE_EXTENSIONS.iter().any(|ext| database.ends_with(ext));
        if looks_like_path {
            return PathBuf::from(database);
        }
        let dir = default.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{}.sqlite", database))
    }

    async fn open(&self, path: &Path, create: bool) -> DbResult<SqliteConnection> {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .foreign_keys(true)
            .busy_timeout(self.config.pool.acquire_timeout)
            .connect()
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to open {}: {}", path.display(), e),
                    connection_suggestion(DriverKind::Sqlite, &e.to_string()),
                )
            })
    }
}

#[async_trait]
impl DriverAdapter for SqliteAdapter {
    fn driver(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    async fn init_pool(&self) -> DbResult<()> {
        debug!(path = %self.config.database, "SQLite has no pool, connections open per checkout");
        self.create_database("").await
    }

    async fn close_pool(&self) -> DbResult<()> {
        Ok(())
    }

    async fn get_connection(&self, database: &str) -> DbResult<AdapterClient> {
        let path = self.resolve_path(database);
        let conn = self.open(&path, false).await?;
        let client = AdapterClient::new(
            Box::new(SqliteClient { conn }),
            HandleKind::Standalone,
            DriverKind::Sqlite,
            database,
        );
        checkout(client, None).await
    }

    async fn create_database(&self, database: &str) -> DbResult<()> {
        let path = self.resolve_path(database);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.open(&path, true).await?.close().await?;
        info!(path = %path.display(), "SQLite database ready");
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> DbResult<()> {
        let path = self.resolve_path(database);
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(path = ?file, "Removed SQLite file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(path = %path.display(), "SQLite database dropped");
        Ok(())
    }
}

struct SqliteClient {
    conn: SqliteConnection,
}

#[async_trait]
impl ClientConnection for SqliteClient {
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult> {
        let info = analyze(sql, DriverKind::Sqlite);
        if params.is_empty() {
            return run_unprepared(&mut self.conn, sql, &info).await;
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        if info.returns_rows() {
            let rows = query.fetch_all(&mut self.conn).await?;
            Ok(RawResult::Rows(rows.iter().map(|r| r.to_json_map()).collect()))
        } else {
            let done = query.execute(&mut self.conn).await?;
            Ok(RawResult::Affected {
                rows_affected: done.rows_affected(),
                last_insert_id: info.is_insert().then(|| done.last_insert_rowid()),
            })
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

async fn run_unprepared(
    conn: &mut SqliteConnection,
    sql: &str,
    info: &StatementInfo,
) -> DbResult<RawResult> {
    let mut parts = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut *conn);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => {
                if !rows.is_empty() {
                    parts.push(RawResult::Rows(std::mem::take(&mut rows)));
                }
                parts.push(RawResult::Affected {
                    rows_affected: done.rows_affected(),
                    last_insert_id: (info.is_insert() && done.rows_affected() > 0)
                        .then(|| done.last_insert_rowid()),
                });
            }
            Either::Right(row) => rows.push(row.to_json_map()),
        }
    }
    if !rows.is_empty() {
        parts.push(RawResult::Rows(rows));
    }
    Ok(collapse(parts))
}
