//! Migration units.
//!
//! A [`Script`] pairs an ordering key and tracked name with a
//! [`MigrationUnit`] that knows how to apply and revert itself on a client.
//! File-based scripts and built-in units share this shape, so ordering and
//! tracking never depend on how a unit is packaged.

use crate::db::adapter::AdapterClient;
use crate::error::DbResult;
use crate::migrate::script::{ScriptFile, SqlScript};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait MigrationUnit: Send + Sync {
    /// Apply the change. Runs inside the caller's transaction.
    async fn up(&self, client: &mut AdapterClient) -> DbResult<()>;

    /// Revert the change. Runs inside the caller's transaction.
    async fn down(&self, client: &mut AdapterClient) -> DbResult<()>;
}

/// One ordered, tracked unit.
#[derive(Clone)]
pub struct Script {
    pub order: u64,
    pub name: String,
    pub unit: Arc<dyn MigrationUnit>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("order", &self.order)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl From<ScriptFile> for Script {
    fn from(file: ScriptFile) -> Self {
        Self {
            order: file.order,
            name: file.name,
            unit: Arc::new(SqlUnit(file.script)),
        }
    }
}

/// Unit backed by a parsed `.sql` file.
pub struct SqlUnit(pub SqlScript);

#[async_trait]
impl MigrationUnit for SqlUnit {
    async fn up(&self, client: &mut AdapterClient) -> DbResult<()> {
        let driver = client.driver();
        run_all(client, self.0.up(driver)).await
    }

    async fn down(&self, client: &mut AdapterClient) -> DbResult<()> {
        let driver = client.driver();
        run_all(client, self.0.down(driver)).await
    }
}

/// Run statements one at a time, in order.
pub async fn run_all(client: &mut AdapterClient, statements: &[String]) -> DbResult<()> {
    for statement in statements {
        client.query_raw(statement, &[]).await?;
    }
    Ok(())
}
