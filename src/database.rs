//! Query, transaction and health façade.
//!
//! Every application query goes through [`Database`]. The target database is
//! resolved as: explicit override, then the flow's context (see
//! [`crate::context`]), then the configured default. An override of `""`
//! means "no specific database" and is passed through as-is.
//!
//! Each call checks out its own client and returns it on every path; a
//! failure to return it is logged and never replaces the call's own result.

use crate::context;
use crate::db::adapter::{AdapterClient, DriverAdapter, PROBE_SQL, release_quietly};
use crate::db::manager::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, QueryResult};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct Database {
    manager: Arc<ConnectionManager>,
    default_database: String,
}

impl Database {
    pub fn new(manager: Arc<ConnectionManager>, default_database: impl Into<String>) -> Self {
        Self {
            manager,
            default_database: default_database.into(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    /// Effective database for a call.
    pub fn resolve_database(&self, database: Option<&str>) -> String {
        match database {
            Some(db) => db.to_string(),
            None => context::current().unwrap_or_else(|| self.default_database.clone()),
        }
    }

    /// Run `sql` with positional `params` and normalize the result.
    pub async fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
        database: Option<&str>,
    ) -> DbResult<QueryResult> {
        if sql.trim().is_empty() {
            return Err(DbError::invalid_input("SQL query cannot be empty"));
        }
        let database = self.resolve_database(database);
        let start = Instant::now();
        debug!(database = %database, phase = "start", params = params.len(), "Executing query");

        let outcome = async {
            let mut client = self.manager.get_client(&database).await?;
            let result = client.query(sql, params).await;
            release_quietly(client).await;
            result
        }
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                info!(
                    database = %database,
                    phase = "end",
                    duration_ms,
                    row_count = result.row_count,
                    "Query completed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(database = %database, phase = "error", duration_ms, error = %e, "Query failed");
                Err(DbError::query(e, database, sql))
            }
        }
    }

    /// `query`, with each row deserialized into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[QueryParam],
        database: Option<&str>,
    ) -> DbResult<Vec<T>> {
        self.query(sql, params, database).await?.rows_as()
    }

    /// `query` for statements that return no rows; yields the affected count.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        database: Option<&str>,
    ) -> DbResult<u64> {
        Ok(self.query(sql, params, database).await?.row_count)
    }

    /// Run `f` inside a transaction on one client.
    ///
    /// Commits when `f` succeeds and rolls back when it fails. A rollback
    /// failure is logged; the error from `f` is what propagates, wrapped with
    /// the database name.
    ///
    /// ```ignore
    /// let id = db
    ///     .with_transaction(
    ///         |client| {
    ///             Box::pin(async move {
    ///                 let r = client.query("INSERT INTO todos (title) VALUES (?)", &["x".into()]).await?;
    ///                 Ok(r.insert_id)
    ///             })
    ///         },
    ///         None,
    ///     )
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(&self, f: F, database: Option<&str>) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut AdapterClient) -> BoxFuture<'c, DbResult<T>> + Send,
        T: Send,
    {
        let database = self.resolve_database(database);
        let start = Instant::now();
        debug!(database = %database, phase = "begin", "Starting transaction");

        let adapter = self
            .manager
            .adapter()
            .await
            .map_err(|e| DbError::transaction(database.as_str(), e))?;
        let mut client = adapter
            .get_connection(&database)
            .await
            .map_err(|e| DbError::transaction(database.as_str(), e))?;

        let outcome = async {
            adapter.begin_transaction(&mut client).await?;
            match f(&mut client).await {
                Ok(value) => match adapter.commit_transaction(&mut client).await {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        rollback_quietly(adapter.as_ref(), &mut client, &database).await;
                        Err(e)
                    }
                },
                Err(e) => {
                    rollback_quietly(adapter.as_ref(), &mut client, &database).await;
                    Err(e)
                }
            }
        }
        .await;
        release_quietly(client).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                info!(database = %database, phase = "commit", duration_ms, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                error!(database = %database, phase = "rollback", duration_ms, error = %e, "Transaction failed");
                Err(DbError::transaction(database, e))
            }
        }
    }

    /// True when a client can be checked out and answers the probe.
    pub async fn health_check(&self, database: Option<&str>) -> bool {
        let database = self.resolve_database(database);
        let mut client = match self.manager.get_client(&database).await {
            Ok(client) => client,
            Err(e) => {
                warn!(database = %database, error = %e, "Health check could not acquire a client");
                return false;
            }
        };
        let probe = client.query(PROBE_SQL, &[]).await;
        release_quietly(client).await;
        match probe {
            Ok(result) => result.rows.len() == 1,
            Err(e) => {
                warn!(database = %database, error = %e, "Health check probe failed");
                false
            }
        }
    }
}

async fn rollback_quietly(
    adapter: &dyn DriverAdapter,
    client: &mut AdapterClient,
    database: &str,
) {
    if let Err(e) = adapter.rollback_transaction(client).await {
        error!(database = %database, error = %e, "Rollback failed");
    }
}
