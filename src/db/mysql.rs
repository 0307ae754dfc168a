//! MySQL / MariaDB adapter.
//!
//! One server-level `MySqlPool` (no database in the connect options). A
//! checkout for a named database runs `USE`. MySQL cannot deselect a
//! database, so on release a switched connection is detached from the pool
//! and closed: every idle pooled connection has no database selected.

use crate::db::adapter::{AdapterClient, ClientConnection, DriverAdapter, HandleKind, checkout};
use crate::db::params::bind_mysql_param;
use crate::db::statement::analyze;
use crate::db::types::RowToJson;
use crate::db::{connection_suggestion, dialect::Dialect};
use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind, QueryParam, RawResult, Row};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Either, MySql, MySqlPool};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct MySqlAdapter {
    config: DbConfig,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .charset("utf8mb4")
            .ssl_mode(if self.config.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        options
    }

    async fn pool(&self) -> DbResult<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(DbError::PoolNotInitialized)
    }
}

#[async_trait]
impl DriverAdapter for MySqlAdapter {
    fn driver(&self) -> DriverKind {
        DriverKind::MySql
    }

    async fn init_pool(&self) -> DbResult<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            debug!("MySQL pool already initialized");
            return Ok(());
        }

        let limits = &self.config.pool;
        let pool = MySqlPoolOptions::new()
            .min_connections(1)
            .max_connections(limits.connection_limit)
            .acquire_timeout(limits.acquire_timeout)
            .idle_timeout(Some(limits.idle_timeout))
            .test_before_acquire(false)
            .connect_with(self.connect_options())
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect: {}", e),
                    connection_suggestion(DriverKind::MySql, &e.to_string()),
                )
            })?;

        info!(
            target_db = %self.config.masked_descriptor(),
            max_connections = limits.connection_limit,
            "MySQL pool initialized"
        );
        *guard = Some(pool);
        Ok(())
    }

    async fn close_pool(&self) -> DbResult<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("MySQL pool closed");
        }
        Ok(())
    }

    async fn get_connection(&self, database: &str) -> DbResult<AdapterClient> {
        let pool = self.pool().await?;
        let conn = pool.acquire().await?;
        let switched = !database.is_empty();
        let client = AdapterClient::new(
            Box::new(MySqlClient {
                conn,
                switched,
            }),
            HandleKind::Pooled,
            DriverKind::MySql,
            database,
        );
        let setup = if switched {
            Dialect::new(DriverKind::MySql).use_database_sql(database)
        } else {
            None
        };
        checkout(client, setup).await
    }
}

struct MySqlClient {
    conn: PoolConnection<MySql>,
    switched: bool,
}

#[async_trait]
impl ClientConnection for MySqlClient {
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult> {
        if params.is_empty() {
            return run_unprepared(&mut self.conn, sql).await;
        }

        let info = analyze(sql, DriverKind::MySql);
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        if info.returns_rows() {
            let rows = query.fetch_all(&mut *self.conn).await?;
            Ok(RawResult::Rows(rows.iter().map(|r| r.to_json_map()).collect()))
        } else {
            let done = query.execute(&mut *self.conn).await?;
            Ok(RawResult::Affected {
                rows_affected: done.rows_affected(),
                last_insert_id: insert_id(done.last_insert_id()),
            })
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let MySqlClient { conn, switched } = *self;
        if !switched {
            return Ok(());
        }
        debug!("Discarding connection with a database selected");
        conn.detach().close().await?;
        Ok(())
    }
}

/// Text-protocol execution for statements without parameters. Handles
/// multi-statement batches and statements MySQL cannot prepare.
async fn run_unprepared(conn: &mut PoolConnection<MySql>, sql: &str) -> DbResult<RawResult> {
    let mut parts = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut **conn);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => {
                if !rows.is_empty() {
                    parts.push(RawResult::Rows(std::mem::take(&mut rows)));
                }
                parts.push(RawResult::Affected {
                    rows_affected: done.rows_affected(),
                    last_insert_id: insert_id(done.last_insert_id()),
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

fn insert_id(id: u64) -> Option<i64> {
    (id > 0).then(|| i64::try_from(id).ok()).flatten()
}

/// A single part stands alone; several become a batch.
pub(crate) fn collapse(mut parts: Vec<RawResult>) -> RawResult {
    match parts.len() {
        0 => RawResult::affected(0),
        1 => parts.remove(0),
        _ => RawResult::Batch(parts),
    }
}
