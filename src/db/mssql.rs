//! SQL Server adapter.
//!
//! `tiberius` has no pool of its own, so every checkout opens a standalone
//! client over a Tokio `TcpStream`. A semaphore sized to the connection limit
//! bounds how many clients are open at once; the permit travels with the
//! client and is returned when the client ends.

use crate::db::adapter::{AdapterClient, ClientConnection, DriverAdapter, HandleKind, checkout};
use crate::db::connection_suggestion;
use crate::db::dialect::Dialect;
use crate::db::mysql::collapse;
use crate::db::params::bind_mssql_param;
use crate::db::statement::{StatementKind, analyze};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind, QueryParam, RawResult};
use async_trait::async_trait;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

type TdsClient = Client<Compat<TcpStream>>;

pub struct MsSqlAdapter {
    config: DbConfig,
    /// `None` until `init_pool`.
    permits: RwLock<Option<Arc<Semaphore>>>,
}

impl MsSqlAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            permits: RwLock::new(None),
        }
    }

    fn tds_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            self.config.password.as_deref().unwrap_or_default(),
        ));
        config.encryption(if self.config.ssl {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        config
    }

    async fn open_client(&self) -> DbResult<TdsClient> {
        let config = self.tds_config();
        let connect = async {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Ok::<_, DbError>(Client::connect(config, tcp.compat_write()).await?)
        };
        connect.await.map_err(|e| match e {
            DbError::Connection { message, .. } => DbError::connection(
                message.clone(),
                connection_suggestion(DriverKind::MsSql, &message),
            ),
            other => {
                let message = other.to_string();
                DbError::connection(
                    format!("Failed to connect: {}", message),
                    connection_suggestion(DriverKind::MsSql, &message),
                )
            }
        })
    }

    async fn permits(&self) -> DbResult<Arc<Semaphore>> {
        self.permits
            .read()
            .await
            .clone()
            .ok_or(DbError::PoolNotInitialized)
    }
}

#[async_trait]
impl DriverAdapter for MsSqlAdapter {
    fn driver(&self) -> DriverKind {
        DriverKind::MsSql
    }

    async fn init_pool(&self) -> DbResult<()> {
        let mut guard = self.permits.write().await;
        if guard.is_some() {
            debug!("SQL Server client limiter already initialized");
            return Ok(());
        }

        // Probe once so bad credentials fail at init rather than first use.
        let probe = self.open_client().await?;
        probe.close().await?;

        let limit = self.config.pool.connection_limit as usize;
        *guard = Some(Arc::new(Semaphore::new(limit)));
        info!(
            target_db = %self.config.masked_descriptor(),
            max_clients = limit,
            "SQL Server client limiter initialized"
        );
        Ok(())
    }

    async fn close_pool(&self) -> DbResult<()> {
        if let Some(permits) = self.permits.write().await.take() {
            permits.close();
            info!("SQL Server client limiter closed");
        }
        Ok(())
    }

    async fn get_connection(&self, database: &str) -> DbResult<AdapterClient> {
        let permits = self.permits().await?;
        let wait = self.config.pool.acquire_timeout;
        let permit = match tokio::time::timeout(wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolNotInitialized),
            Err(_) => {
                return Err(DbError::timeout(
                    "SQL Server client acquire",
                    wait.as_secs(),
                ));
            }
        };

        let client = self.open_client().await?;
        let client = AdapterClient::new(
            Box::new(MsSqlClient {
                client,
                _permit: permit,
            }),
            HandleKind::Standalone,
            DriverKind::MsSql,
            database,
        );
        let setup = if database.is_empty() {
            None
        } else {
            Dialect::new(DriverKind::MsSql).use_database_sql(database)
        };
        checkout(client, setup).await
    }
}

struct MsSqlClient {
    client: TdsClient,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl ClientConnection for MsSqlClient {
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult> {
        let info = analyze(sql, DriverKind::MsSql);

        // Session statements (USE, transaction verbs) and DDL batches must run
        // unwrapped; sp_executesql would scope them to its own batch.
        let unwrapped = info.is_session_control()
            || info.is_batch()
            || info.kinds.iter().all(|k| *k == StatementKind::Definition);
        if params.is_empty() && !info.returns_rows() && unwrapped {
            self.client.simple_query(sql).await?.into_results().await?;
            return Ok(RawResult::affected(0));
        }

        let mut query = Query::new(sql);
        for param in params {
            bind_mssql_param(&mut query, param);
        }
        if info.returns_rows() {
            let sets = query.query(&mut self.client).await?.into_results().await?;
            let parts = sets
                .into_iter()
                .map(|rows| RawResult::Rows(rows.iter().map(|r| r.to_json_map()).collect()))
                .collect();
            Ok(collapse(parts))
        } else {
            let done = query.execute(&mut self.client).await?;
            Ok(RawResult::affected(done.total()))
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let MsSqlClient { client, _permit } = *self;
        client.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MsSqlAdapter {
        MsSqlAdapter::new(
            DbConfig::new(DriverKind::MsSql, "localhost", "app")
                .with_credentials("sa", Some("secret".to_string())),
        )
    }

    #[test]
    fn test_tds_config_address() {
        let config = adapter().tds_config();
        assert_eq!(config.get_addr(), "localhost:1433");
    }

    #[tokio::test]
    async fn test_get_connection_before_init() {
        let err = adapter().get_connection("app").await.unwrap_err();
        assert!(matches!(err, DbError::PoolNotInitialized));
    }

    #[tokio::test]
    async fn test_close_without_limiter_is_ok() {
        adapter().close_pool().await.unwrap();
    }
}
