//! The uniform driver contract.
//!
//! Each engine implements [`DriverAdapter`]; checked-out connections are
//! handed out as [`AdapterClient`], which wraps an engine connection behind
//! [`ClientConnection`] and records whether it came from a pool or is a
//! standalone handle. Releasing consumes the client, so a client cannot be
//! released twice.

use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, QueryResult, RawResult};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Liveness probe run on every checkout.
pub const PROBE_SQL: &str = "SELECT 1";

/// Where a client's physical connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Checked out of a shared pool; give it back with `release()`.
    Pooled,
    /// Opened for this checkout alone; close it with `end()`.
    Standalone,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled => write!(f, "pooled"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// One live engine connection.
#[async_trait]
pub trait ClientConnection: Send {
    /// Execute `sql` with positional `params`.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult>;

    /// Give the connection back (pooled) or close it (standalone).
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// A checked-out connection, owned by the flow that acquired it.
pub struct AdapterClient {
    inner: Box<dyn ClientConnection>,
    kind: HandleKind,
    driver: DriverKind,
    database: String,
}

impl std::fmt::Debug for AdapterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterClient")
            .field("kind", &self.kind)
            .field("driver", &self.driver)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl AdapterClient {
    pub fn new(
        inner: Box<dyn ClientConnection>,
        kind: HandleKind,
        driver: DriverKind,
        database: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            kind,
            driver,
            database: database.into(),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::new(self.driver)
    }

    /// Database this client is bound to; empty when none was selected.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Execute and normalize.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let raw = self.inner.query(sql, params).await?;
        Ok(QueryResult::from_raw(raw))
    }

    /// Execute and return the engine's raw result shape.
    pub async fn query_raw(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult> {
        self.inner.query(sql, params).await
    }

    /// Return a pooled client to its pool.
    pub async fn release(self) -> DbResult<()> {
        if self.kind != HandleKind::Pooled {
            return Err(DbError::internal(
                "release() called on a standalone client; use end()",
            ));
        }
        self.inner.close().await
    }

    /// Close a standalone client.
    pub async fn end(self) -> DbResult<()> {
        if self.kind != HandleKind::Standalone {
            return Err(DbError::internal(
                "end() called on a pooled client; use release()",
            ));
        }
        self.inner.close().await
    }

    /// `release()` or `end()`, whichever matches the handle kind.
    pub async fn close(self) -> DbResult<()> {
        match self.kind {
            HandleKind::Pooled => self.release().await,
            HandleKind::Standalone => self.end().await,
        }
    }
}

/// Per-engine implementation of the driver contract.
///
/// Adapters are built from a [`DbConfig`](crate::models::DbConfig) and own
/// whatever pool state the engine needs.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    fn driver(&self) -> DriverKind;

    fn dialect(&self) -> Dialect {
        Dialect::new(self.driver())
    }

    /// Build the pool. Idempotent: a second call while initialized is a no-op.
    async fn init_pool(&self) -> DbResult<()>;

    /// Terminate every pooled connection. Safe to call without a pool.
    async fn close_pool(&self) -> DbResult<()>;

    /// Check out one connection bound to `database` (empty: none selected)
    /// and probe it with `SELECT 1`.
    async fn get_connection(&self, database: &str) -> DbResult<AdapterClient>;

    /// `init_pool` followed by `get_connection`.
    async fn connect(&self, database: &str) -> DbResult<AdapterClient> {
        self.init_pool().await?;
        self.get_connection(database).await
    }

    /// Release or end `client`, whichever its handle kind requires.
    async fn disconnect(&self, client: AdapterClient) -> DbResult<()> {
        client.close().await
    }

    async fn query(
        &self,
        client: &mut AdapterClient,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        client.query(sql, params).await
    }

    async fn begin_transaction(&self, client: &mut AdapterClient) -> DbResult<()> {
        client.query_raw(self.dialect().begin_sql(), &[]).await?;
        Ok(())
    }

    async fn commit_transaction(&self, client: &mut AdapterClient) -> DbResult<()> {
        client.query_raw(self.dialect().commit_sql(), &[]).await?;
        Ok(())
    }

    async fn rollback_transaction(&self, client: &mut AdapterClient) -> DbResult<()> {
        client.query_raw(self.dialect().rollback_sql(), &[]).await?;
        Ok(())
    }

    /// Create `database` unless it already exists.
    async fn create_database(&self, database: &str) -> DbResult<()> {
        let sql = self.dialect().create_database_sql(database).ok_or_else(|| {
            DbError::internal(format!("{} has no create database statement", self.driver()))
        })?;
        run_on_server(self, &sql).await
    }

    /// Drop `database` if it exists.
    async fn drop_database(&self, database: &str) -> DbResult<()> {
        let sql = self.dialect().drop_database_sql(database).ok_or_else(|| {
            DbError::internal(format!("{} has no drop database statement", self.driver()))
        })?;
        run_on_server(self, &sql).await
    }
}

/// Run one statement on a client with no database selected.
async fn run_on_server<A: DriverAdapter + ?Sized>(adapter: &A, sql: &str) -> DbResult<()> {
    let mut client = adapter.get_connection("").await?;
    let result = client.query_raw(sql, &[]).await;
    release_quietly(client).await;
    result.map(|_| ())
}

/// Close a client, logging instead of failing.
pub async fn release_quietly(client: AdapterClient) {
    let kind = client.kind();
    let database = client.database().to_string();
    if let Err(e) = client.close().await {
        warn!(database = %database, handle = %kind, error = %e, "Failed to release client");
    }
}

/// Finish a checkout: run the optional `setup` statement, then the liveness
/// probe. On failure the client is released before the error propagates.
pub async fn checkout(mut client: AdapterClient, setup: Option<String>) -> DbResult<AdapterClient> {
    let prepared = async {
        if let Some(sql) = setup.as_deref() {
            client.query_raw(sql, &[]).await?;
        }
        client.query_raw(PROBE_SQL, &[]).await
    }
    .await;

    match prepared {
        Ok(_) => {
            debug!(database = %client.database(), handle = %client.kind(), "Client checked out");
            Ok(client)
        }
        Err(e) => {
            release_quietly(client).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
        fail_probe: bool,
    }

    #[async_trait]
    impl ClientConnection for CountingConnection {
        async fn query(&mut self, _sql: &str, _params: &[QueryParam]) -> DbResult<RawResult> {
            if self.fail_probe {
                return Err(DbError::driver("probe failed", None));
            }
            Ok(RawResult::affected(0))
        }

        async fn close(self: Box<Self>) -> DbResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn client(kind: HandleKind, fail_probe: bool) -> (AdapterClient, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = CountingConnection {
            closes: closes.clone(),
            fail_probe,
        };
        (
            AdapterClient::new(Box::new(conn), kind, DriverKind::Sqlite, "app"),
            closes,
        )
    }

    #[tokio::test]
    async fn test_release_rejects_standalone() {
        let (c, closes) = client(HandleKind::Standalone, false);
        assert!(c.release().await.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_dispatches_on_kind() {
        let (c, closes) = client(HandleKind::Standalone, false);
        c.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let (c, closes) = client(HandleKind::Pooled, false);
        c.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_releases_client() {
        let (c, closes) = client(HandleKind::Pooled, true);
        let err = checkout(c, Some("USE `app`".to_string())).await.unwrap_err();
        assert!(err.to_string().contains("probe failed"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
