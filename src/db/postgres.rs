//! PostgreSQL adapter.
//!
//! PostgreSQL cannot switch databases on a live session, so each database
//! gets its own lazily created `PgPool`. A checkout with no database uses the
//! `postgres` maintenance database, which is also where databases are
//! created and dropped.
//!
//! # Connection bound
//!
//! One semaphore of `connection_limit` permits is shared by every pool, so
//! at most that many connections are checked out across all databases. Pools
//! keep no minimum connections, sqlx closes connections idle past
//! `idle_timeout`, and a background sweeper closes whole tenant pools that
//! have been unused for that long. The maintenance pool is never swept.
//!
//! # Concurrency
//!
//! - **`OnceCell` per database**: single-flight pool creation, concurrent
//!   checkouts for the same database wait for the first to finish
//! - Locks on the pool map are released before any pool is created or closed
//! - The sweeper re-checks idleness under the write lock before removing
//!   a pool; a checkout racing with removal finishes on the orphaned pool

use crate::db::adapter::{AdapterClient, ClientConnection, DriverAdapter, HandleKind, checkout};
use crate::db::connection_suggestion;
use crate::db::mysql::collapse;
use crate::db::params::bind_postgres_param;
use crate::db::statement::analyze;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind, QueryParam, RawResult, Row};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Either, PgPool, Postgres};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Database used for checkouts that name no database.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// SQLSTATE for `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// Upper bound on the sweeper period.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A database's pool and when it was last handed out.
struct PoolEntry {
    pool: PgPool,
    created: Instant,
    last_used_ms: AtomicU64,
}

impl PoolEntry {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last_used = self.created + Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        now.saturating_duration_since(last_used)
    }

    /// Some connection of this pool is checked out.
    fn in_use(&self) -> bool {
        self.pool.size() as usize > self.pool.num_idle()
    }
}

type PoolMap = HashMap<String, Arc<OnceCell<PoolEntry>>>;

/// `None` until `init_pool`.
type SharedPools = Arc<RwLock<Option<PoolMap>>>;

pub struct PostgresAdapter {
    config: DbConfig,
    pools: SharedPools,
    permits: Arc<Semaphore>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PostgresAdapter {
    pub fn new(config: DbConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool.connection_limit as usize));
        Self {
            config,
            pools: Arc::new(RwLock::new(None)),
            permits,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .database(database)
            .ssl_mode(if self.config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        options
    }

    fn pool_options(&self) -> PgPoolOptions {
        let limits = &self.config.pool;
        PgPoolOptions::new()
            .min_connections(0)
            .max_connections(limits.connection_limit)
            .acquire_timeout(limits.acquire_timeout)
            .idle_timeout(Some(limits.idle_timeout))
            .test_before_acquire(false)
    }

    /// Get or create the pool for `database`.
    async fn pool_for(&self, database: &str) -> DbResult<PgPool> {
        let cell = {
            let mut guard = self.pools.write().await;
            let pools = guard.as_mut().ok_or(DbError::PoolNotInitialized)?;
            Arc::clone(pools.entry(database.to_string()).or_default())
        };

        let entry = cell
            .get_or_try_init(|| async {
                debug!(database = %database, "Creating PostgreSQL pool");
                self.pool_options()
                    .connect_with(self.connect_options(database))
                    .await
                    .map(PoolEntry::new)
                    .map_err(|e| {
                        DbError::connection(
                            format!("Failed to connect to {}: {}", database, e),
                            connection_suggestion(DriverKind::Postgres, &e.to_string()),
                        )
                    })
            })
            .await?;
        entry.touch();
        Ok(entry.pool.clone())
    }

    /// Wait for one of the shared connection permits.
    async fn permit(&self) -> DbResult<OwnedSemaphorePermit> {
        let wait = self.config.pool.acquire_timeout;
        match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DbError::PoolNotInitialized),
            Err(_) => Err(DbError::timeout(
                "PostgreSQL connection acquire",
                wait.as_secs(),
            )),
        }
    }

    /// Close and forget the pool for `database`, if one exists.
    async fn discard_pool(&self, database: &str) {
        let cell = {
            let mut guard = self.pools.write().await;
            guard.as_mut().and_then(|pools| pools.remove(database))
        };
        if let Some(entry) = cell.as_ref().and_then(|c| c.get()) {
            entry.pool.close().await;
            debug!(database = %database, "PostgreSQL pool discarded");
        }
    }

    fn start_sweeper(&self) {
        let idle_timeout = self.config.pool.idle_timeout;
        let period = idle_timeout
            .min(MAX_SWEEP_INTERVAL)
            .max(Duration::from_secs(1));
        let pools = Arc::downgrade(&self.pools);
        let handle = tokio::spawn(sweep_loop(pools, period, idle_timeout));
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().ok().and_then(|mut g| g.take()) {
            handle.abort();
        }
    }

    fn target(database: &str) -> &str {
        if database.is_empty() {
            MAINTENANCE_DATABASE
        } else {
            database
        }
    }
}

impl Drop for PostgresAdapter {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

async fn sweep_loop(pools: Weak<RwLock<Option<PoolMap>>>, period: Duration, idle_timeout: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(shared) = pools.upgrade() else {
            return;
        };
        sweep_idle_pools(&shared, idle_timeout, Instant::now()).await;
    }
}

/// Remove and close tenant pools unused for longer than `idle_timeout`.
/// Returns the databases whose pools were closed.
async fn sweep_idle_pools(pools: &RwLock<Option<PoolMap>>, idle_timeout: Duration, now: Instant) -> Vec<String> {
    let is_stale = |database: &str, entry: &PoolEntry| {
        database != MAINTENANCE_DATABASE && !entry.in_use() && entry.idle_for(now) > idle_timeout
    };

    let candidates: Vec<String> = {
        let guard = pools.read().await;
        guard
            .iter()
            .flatten()
            .filter(|(database, cell)| cell.get().is_some_and(|e| is_stale(database.as_str(), e)))
            .map(|(database, _)| database.clone())
            .collect()
    };

    let mut closed = Vec::new();
    for database in candidates {
        let removed = {
            let mut guard = pools.write().await;
            let Some(map) = guard.as_mut() else {
                break;
            };
            let still_stale = map
                .get(&database)
                .and_then(|cell| cell.get())
                .is_some_and(|e| is_stale(database.as_str(), e));
            if still_stale { map.remove(&database) } else { None }
        };
        if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
            info!(database = %database, "Closing idle database pool");
            entry.pool.close().await;
            closed.push(database);
        }
    }
    closed
}

#[async_trait]
impl DriverAdapter for PostgresAdapter {
    fn driver(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn init_pool(&self) -> DbResult<()> {
        {
            let mut guard = self.pools.write().await;
            if guard.is_some() {
                debug!("PostgreSQL pools already initialized");
                return Ok(());
            }
            *guard = Some(HashMap::new());
        }

        if let Err(e) = self.pool_for(MAINTENANCE_DATABASE).await {
            *self.pools.write().await = None;
            return Err(e);
        }
        self.start_sweeper();
        info!(
            target_db = %self.config.masked_descriptor(),
            max_connections = self.config.pool.connection_limit,
            "PostgreSQL pools initialized"
        );
        Ok(())
    }

    async fn close_pool(&self) -> DbResult<()> {
        self.stop_sweeper();
        let pools = self.pools.write().await.take();
        for (database, cell) in pools.into_iter().flatten() {
            if let Some(entry) = cell.get() {
                info!(database = %database, "Closing database pool");
                entry.pool.close().await;
            }
        }
        Ok(())
    }

    async fn get_connection(&self, database: &str) -> DbResult<AdapterClient> {
        let pool = self.pool_for(Self::target(database)).await?;
        let permit = self.permit().await?;
        let conn = pool.acquire().await?;
        let client = AdapterClient::new(
            Box::new(PostgresClient {
                conn,
                _permit: permit,
            }),
            HandleKind::Pooled,
            DriverKind::Postgres,
            database,
        );
        checkout(client, None).await
    }

    async fn create_database(&self, database: &str) -> DbResult<()> {
        let mut client = self.get_connection("").await?;
        let result = async {
            let exists = client
                .query(
                    "SELECT 1 FROM pg_database WHERE datname = $1",
                    &[QueryParam::from(database)],
                )
                .await?;
            if !exists.is_empty() {
                return Ok(());
            }
            let sql = format!("CREATE DATABASE {}", self.dialect().quote_ident(database));
            match client.query_raw(&sql, &[]).await {
                Err(DbError::Driver {
                    sql_state: Some(code),
                    ..
                }) if code == DUPLICATE_DATABASE => Ok(()),
                other => other.map(|_| ()),
            }
        }
        .await;
        crate::db::adapter::release_quietly(client).await;
        result
    }

    async fn drop_database(&self, database: &str) -> DbResult<()> {
        self.discard_pool(database).await;
        let sql = format!(
            "DROP DATABASE IF EXISTS {}",
            self.dialect().quote_ident(database)
        );
        let mut client = self.get_connection("").await?;
        let result = client.query_raw(&sql, &[]).await.map(|_| ());
        crate::db::adapter::release_quietly(client).await;
        result
    }
}

struct PostgresClient {
    conn: PoolConnection<Postgres>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl ClientConnection for PostgresClient {
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<RawResult> {
        if params.is_empty() {
            return run_unprepared(&mut self.conn, sql).await;
        }

        let info = analyze(sql, DriverKind::Postgres);
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        if info.returns_rows() {
            let rows = query.fetch_all(&mut *self.conn).await?;
            Ok(RawResult::Rows(rows.iter().map(|r| r.to_json_map()).collect()))
        } else {
            let done = query.execute(&mut *self.conn).await?;
            Ok(RawResult::affected(done.rows_affected()))
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        // Dropping a pool connection returns it to its pool and frees the permit.
        Ok(())
    }
}

async fn run_unprepared(conn: &mut PoolConnection<Postgres>, sql: &str) -> DbResult<RawResult> {
    let mut parts = Vec::new();
    let mut rows: Vec<Row> = Vec::new();
    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut **conn);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => {
                if !rows.is_empty() {
                    parts.push(RawResult::Rows(std::mem::take(&mut rows)));
                }
                parts.push(RawResult::affected(done.rows_affected()));
            }
            Either::Right(row) => rows.push(row.to_json_map()),
        }
    }
    if !rows.is_empty() {
        parts.push(RawResult::Rows(rows));
    }
    Ok(collapse(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_database_targets_maintenance() {
        assert_eq!(PostgresAdapter::target(""), MAINTENANCE_DATABASE);
        assert_eq!(PostgresAdapter::target("tenant_a"), "tenant_a");
    }

    #[tokio::test]
    async fn test_get_connection_before_init() {
        let adapter = PostgresAdapter::new(DbConfig::new(DriverKind::Postgres, "localhost", "app"));
        let err = adapter.get_connection("app").await.unwrap_err();
        assert!(matches!(err, DbError::PoolNotInitialized));
    }

    fn lazy_entry(adapter: &PostgresAdapter, database: &str) -> Arc<OnceCell<PoolEntry>> {
        let pool = adapter
            .pool_options()
            .connect_lazy_with(adapter.connect_options(database));
        Arc::new(OnceCell::new_with(Some(PoolEntry::new(pool))))
    }

    #[tokio::test]
    async fn test_sweep_closes_only_idle_tenant_pools() {
        let adapter = PostgresAdapter::new(DbConfig::new(DriverKind::Postgres, "localhost", "app"));
        let stale = lazy_entry(&adapter, "tenant_stale");
        let fresh = lazy_entry(&adapter, "tenant_fresh");
        let maintenance = lazy_entry(&adapter, MAINTENANCE_DATABASE);
        let base = stale.get().unwrap().created;
        fresh.get().unwrap().last_used_ms.store(100_000, Ordering::Release);

        let stale_pool = stale.get().unwrap().pool.clone();
        let map: PoolMap = [
            ("tenant_stale".to_string(), stale),
            ("tenant_fresh".to_string(), fresh),
            (MAINTENANCE_DATABASE.to_string(), maintenance),
        ]
        .into_iter()
        .collect();
        let pools = RwLock::new(Some(map));

        let now = base + Duration::from_secs(120);
        let closed = sweep_idle_pools(&pools, Duration::from_secs(60), now).await;
        assert_eq!(closed, vec!["tenant_stale".to_string()]);
        assert!(stale_pool.is_closed());

        let guard = pools.read().await;
        let mut remaining: Vec<_> = guard.as_ref().unwrap().keys().cloned().collect();
        remaining.sort();
        assert_eq!(remaining, vec!["postgres", "tenant_fresh"]);
    }

    #[tokio::test]
    async fn test_permits_bound_checkouts_across_databases() {
        let mut config = DbConfig::new(DriverKind::Postgres, "localhost", "app");
        config.pool.connection_limit = 1;
        config.pool.acquire_timeout = Duration::from_millis(50);
        let adapter = PostgresAdapter::new(config);

        let held = adapter.permit().await.unwrap();
        let err = adapter.permit().await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        drop(held);
        adapter.permit().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_without_pool_is_ok() {
        let adapter = PostgresAdapter::new(DbConfig::new(DriverKind::Postgres, "localhost", "app"));
        adapter.close_pool().await.unwrap();
    }

    #[tokio::test]
    async fn test_postgres_round_trip() {
        let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
            eprintln!("TEST_POSTGRES_URL not set, skipping PostgreSQL adapter test");
            return;
        };
        let parsed = url::Url::parse(&url).unwrap();
        let config = DbConfig::new(
            DriverKind::Postgres,
            parsed.host_str().unwrap_or("localhost"),
            parsed.path().trim_start_matches('/'),
        )
        .with_port(parsed.port().unwrap_or(5432))
        .with_credentials(parsed.username(), parsed.password().map(String::from));

        let adapter = PostgresAdapter::new(config);
        adapter.init_pool().await.unwrap();
        let mut client = adapter.get_connection("").await.unwrap();
        let result = client
            .query("SELECT $1::bigint AS one", &[QueryParam::Int(1)])
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        client.release().await.unwrap();
        adapter.close_pool().await.unwrap();
    }
}
