//! Connection manager.
//!
//! Owns the one active adapter for the process. The manager is constructed
//! explicitly by the composition root (a binary or a test) and shared behind
//! an `Arc`; re-initializing closes the previous adapter first.
//!
//! # Concurrency
//!
//! - `initialize` and `close` serialize on an async mutex, so concurrent
//!   initializations never race to build two adapters
//! - Readers only hold the state lock long enough to clone the adapter `Arc`

use crate::db::adapter::{AdapterClient, DriverAdapter};
use crate::db::mssql::MsSqlAdapter;
use crate::db::mysql::MySqlAdapter;
use crate::db::postgres::PostgresAdapter;
use crate::db::sqlite::SqliteAdapter;
use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Builds the adapter for a config.
pub type AdapterFactory =
    Arc<dyn Fn(&DbConfig) -> DbResult<Arc<dyn DriverAdapter>> + Send + Sync>;

/// Adapter for `config.driver`.
pub fn create_adapter(config: &DbConfig) -> DbResult<Arc<dyn DriverAdapter>> {
    let adapter: Arc<dyn DriverAdapter> = match config.driver {
        DriverKind::MySql => Arc::new(MySqlAdapter::new(config.clone())),
        DriverKind::Postgres => Arc::new(PostgresAdapter::new(config.clone())),
        DriverKind::Sqlite => Arc::new(SqliteAdapter::new(config.clone())),
        DriverKind::MsSql => Arc::new(MsSqlAdapter::new(config.clone())),
    };
    Ok(adapter)
}

/// Lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How often `initialize` retries a failed pool build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// One retry after a fixed backoff in production-like environments,
    /// none otherwise.
    pub fn for_environment(production_like: bool) -> Self {
        if production_like {
            Self {
                max_retries: 1,
                backoff: Duration::from_secs(crate::config::PRODUCTION_INIT_BACKOFF_SECS),
            }
        } else {
            Self::none()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

struct Inner {
    state: ManagerState,
    adapter: Option<Arc<dyn DriverAdapter>>,
    config: Option<DbConfig>,
}

pub struct ConnectionManager {
    factory: AdapterFactory,
    retry: RetryPolicy,
    init_lock: Mutex<()>,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager building the adapter that matches each config's driver.
    pub fn new(retry: RetryPolicy) -> Self {
        Self::with_factory(Arc::new(create_adapter), retry)
    }

    /// Manager with a custom adapter factory.
    pub fn with_factory(factory: AdapterFactory, retry: RetryPolicy) -> Self {
        Self {
            factory,
            retry,
            init_lock: Mutex::new(()),
            inner: RwLock::new(Inner {
                state: ManagerState::Uninitialized,
                adapter: None,
                config: None,
            }),
        }
    }

    /// Build the adapter for `config` and initialize its pool.
    ///
    /// Any previously active adapter is closed first. On failure the manager
    /// is left uninitialized.
    pub async fn initialize(&self, config: DbConfig) -> DbResult<()> {
        config.validate()?;
        let _init = self.init_lock.lock().await;

        let previous = {
            let mut inner = self.inner.write().await;
            inner.state = ManagerState::Initializing;
            inner.config = None;
            inner.adapter.take()
        };
        if let Some(previous) = previous {
            info!(driver = %previous.driver(), "Closing previous adapter before re-initializing");
            if let Err(e) = previous.close_pool().await {
                warn!(error = %e, "Failed to close previous adapter");
            }
        }

        let result = self.build(&config).await;
        let mut inner = self.inner.write().await;
        match result {
            Ok(adapter) => {
                info!(
                    driver = %config.driver,
                    target_db = %config.masked_descriptor(),
                    "Connection manager ready"
                );
                inner.state = ManagerState::Ready;
                inner.adapter = Some(adapter);
                inner.config = Some(config);
                Ok(())
            }
            Err(e) => {
                error!(driver = %config.driver, error = %e, "Connection manager initialization failed");
                inner.state = ManagerState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn build(&self, config: &DbConfig) -> DbResult<Arc<dyn DriverAdapter>> {
        let adapter = (self.factory)(config)?;
        let mut attempt = 0;
        loop {
            match adapter.init_pool().await {
                Ok(()) => return Ok(adapter),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        driver = %config.driver,
                        attempt,
                        backoff_ms = self.retry.backoff.as_millis() as u64,
                        error = %e,
                        "Pool initialization failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => {
                    if let Err(close_err) = adapter.close_pool().await {
                        debug!(error = %close_err, "Failed to close partially built pool");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// The active adapter.
    pub async fn adapter(&self) -> DbResult<Arc<dyn DriverAdapter>> {
        self.inner
            .read()
            .await
            .adapter
            .clone()
            .ok_or(DbError::PoolNotInitialized)
    }

    /// Check out a client bound to `database` (empty: none selected).
    pub async fn get_client(&self, database: &str) -> DbResult<AdapterClient> {
        self.adapter().await?.get_connection(database).await
    }

    /// Config of the active adapter.
    pub async fn config(&self) -> Option<DbConfig> {
        self.inner.read().await.config.clone()
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.read().await.state
    }

    /// Close the active adapter. The manager is reset even when closing fails.
    pub async fn close(&self) -> DbResult<()> {
        let _init = self.init_lock.lock().await;
        let adapter = {
            let mut inner = self.inner.write().await;
            inner.state = ManagerState::Closed;
            inner.config = None;
            inner.adapter.take()
        };
        match adapter {
            Some(adapter) => {
                let result = adapter.close_pool().await;
                match &result {
                    Ok(()) => info!(driver = %adapter.driver(), "Connection manager closed"),
                    Err(e) => warn!(driver = %adapter.driver(), error = %e, "Adapter close failed"),
                }
                result
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::adapter::{ClientConnection, HandleKind};
    use crate::models::{QueryParam, RawResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        inits: AtomicUsize,
        closes: AtomicUsize,
        fail_inits: AtomicUsize,
    }

    struct StubAdapter {
        counters: Arc<Counters>,
    }

    struct NullConnection;

    #[async_trait]
    impl ClientConnection for NullConnection {
        async fn query(&mut self, _sql: &str, _params: &[QueryParam]) -> DbResult<RawResult> {
            Ok(RawResult::affected(0))
        }

        async fn close(self: Box<Self>) -> DbResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl DriverAdapter for StubAdapter {
        fn driver(&self) -> DriverKind {
            DriverKind::Sqlite
        }

        async fn init_pool(&self) -> DbResult<()> {
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            let remaining = self.counters.fail_inits.load(Ordering::SeqCst);
            if remaining > 0 {
                self.counters.fail_inits.fetch_sub(1, Ordering::SeqCst);
                return Err(DbError::connection("refused", "start the server"));
            }
            Ok(())
        }

        async fn close_pool(&self) -> DbResult<()> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_connection(&self, database: &str) -> DbResult<AdapterClient> {
            Ok(AdapterClient::new(
                Box::new(NullConnection),
                HandleKind::Standalone,
                DriverKind::Sqlite,
                database,
            ))
        }
    }

    fn manager(counters: Arc<Counters>, retry: RetryPolicy) -> ConnectionManager {
        ConnectionManager::with_factory(
            Arc::new(move |_config: &DbConfig| {
                let adapter: Arc<dyn DriverAdapter> = Arc::new(StubAdapter {
                    counters: counters.clone(),
                });
                Ok(adapter)
            }),
            retry,
        )
    }

    #[tokio::test]
    async fn test_get_client_before_initialize() {
        let m = manager(Arc::default(), RetryPolicy::none());
        assert_eq!(m.state().await, ManagerState::Uninitialized);
        let err = m.get_client("").await.unwrap_err();
        assert!(matches!(err, DbError::PoolNotInitialized));
    }

    #[tokio::test]
    async fn test_reinitialize_closes_previous() {
        let counters = Arc::new(Counters::default());
        let m = manager(counters.clone(), RetryPolicy::none());
        m.initialize(DbConfig::sqlite("a.sqlite")).await.unwrap();
        m.initialize(DbConfig::sqlite("b.sqlite")).await.unwrap();
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(m.config().await.unwrap().database, "b.sqlite");
        assert_eq!(m.state().await, ManagerState::Ready);
    }

    #[tokio::test]
    async fn test_retry_policy_retries_once() {
        let counters = Arc::new(Counters::default());
        counters.fail_inits.store(1, Ordering::SeqCst);
        let retry = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        let m = manager(counters.clone(), retry);
        m.initialize(DbConfig::sqlite("a.sqlite")).await.unwrap();
        assert_eq!(counters.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_without_retry_leaves_uninitialized() {
        let counters = Arc::new(Counters::default());
        counters.fail_inits.store(1, Ordering::SeqCst);
        let m = manager(counters.clone(), RetryPolicy::none());
        let err = m.initialize(DbConfig::sqlite("a.sqlite")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);
        assert_eq!(m.state().await, ManagerState::Uninitialized);
        assert!(m.adapter().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_factory() {
        let counters = Arc::new(Counters::default());
        let m = manager(counters.clone(), RetryPolicy::none());
        let err = m.initialize(DbConfig::sqlite("")).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert_eq!(counters.inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_then_reinitialize() {
        let counters = Arc::new(Counters::default());
        let m = manager(counters.clone(), RetryPolicy::none());
        m.initialize(DbConfig::sqlite("a.sqlite")).await.unwrap();
        m.close().await.unwrap();
        assert_eq!(m.state().await, ManagerState::Closed);
        assert!(m.get_client("").await.is_err());
        m.close().await.unwrap();
        m.initialize(DbConfig::sqlite("a.sqlite")).await.unwrap();
        assert!(m.get_client("").await.is_ok());
    }

    #[test]
    fn test_retry_policy_for_environment() {
        assert_eq!(RetryPolicy::for_environment(false).max_retries, 0);
        let production = RetryPolicy::for_environment(true);
        assert_eq!(production.max_retries, 1);
        assert_eq!(production.backoff, Duration::from_secs(5));
    }
}
