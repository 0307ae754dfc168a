//! Migration and seed orchestration.
//!
//! For every target database: make sure the database and its tracking table
//! exist, load the ordered scripts, then apply each untracked script. A
//! script's own statements and its tracking row share one transaction, so a
//! script is either fully recorded or not at all. The first failure stops
//! the run.
//!
//! The master flavor targets the master database and also receives the
//! built-in registry units. The tenant flavor reads the registry and repeats
//! the operation for each tenant database.

use crate::database::Database;
use crate::db::adapter::DriverAdapter;
use crate::db::dialect::{Dialect, validate_database_name};
use crate::error::{DbError, DbResult};
use crate::migrate::builtin;
use crate::migrate::script::load_dir;
use crate::migrate::unit::Script;
use crate::models::{DriverKind, QueryParam, column_string};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TENANT_DATABASES_SQL: &str = "SELECT tenant_id, db_name FROM tenants ORDER BY tenant_id";

/// Which databases a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Master,
    Tenant,
}

impl Flavor {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Tenant => "tenant",
        }
    }
}

/// Schema changes or data seeds. Each is tracked in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Migration,
    Seed,
}

impl ScriptKind {
    pub fn tracking_table(&self) -> &'static str {
        match self {
            Self::Migration => "migrations",
            Self::Seed => "seeds",
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            Self::Migration => "migrations",
            Self::Seed => "seeds",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Apply pending migrations.
    Migrate,
    /// Revert tracked scripts in reverse order.
    Rollback,
    /// Revert everything, then drop the tracking table and the database.
    Reset,
    /// Apply pending seeds.
    Seed,
    /// Report applied and pending scripts.
    Status,
}

impl FromStr for Operation {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "migrate" => Ok(Self::Migrate),
            "rollback" => Ok(Self::Rollback),
            "reset" => Ok(Self::Reset),
            "seed" => Ok(Self::Seed),
            "status" => Ok(Self::Status),
            other => Err(DbError::invalid_input(format!(
                "invalid operation: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrate => write!(f, "migrate"),
            Self::Rollback => write!(f, "rollback"),
            Self::Reset => write!(f, "reset"),
            Self::Seed => write!(f, "seed"),
            Self::Status => write!(f, "status"),
        }
    }
}

/// Outcome of one operation on one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub database: String,
    /// Scripts applied (or reverted, for rollback and reset), in run order.
    pub applied: Vec<String>,
    /// Scripts left alone: already tracked on apply, untracked on revert.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    pub name: String,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub scripts: Vec<ScriptStatus>,
}

pub struct Orchestrator {
    db: Arc<Database>,
    scripts_dir: PathBuf,
    master_database: String,
}

impl Orchestrator {
    /// `scripts_dir` holds `migrations/{master,tenant}` and
    /// `seeds/{master,tenant}`.
    pub fn new(
        db: Arc<Database>,
        scripts_dir: impl Into<PathBuf>,
        master_database: impl Into<String>,
    ) -> Self {
        Self {
            db,
            scripts_dir: scripts_dir.into(),
            master_database: master_database.into(),
        }
    }

    /// Run `operation` for every database of `flavor`.
    ///
    /// `Status` is logged and yields an empty report per database; use
    /// [`Orchestrator::status`] for structured output.
    pub async fn run(
        &self,
        flavor: Flavor,
        kind: ScriptKind,
        operation: Operation,
    ) -> DbResult<Vec<RunReport>> {
        info!(?flavor, ?kind, operation = %operation, "Starting run");
        let reports = match operation {
            Operation::Migrate | Operation::Seed => self.apply(flavor, kind).await?,
            Operation::Rollback => self.rollback(flavor, kind).await?,
            Operation::Reset => self.reset(flavor).await?,
            Operation::Status => {
                let statuses = self.status(flavor, kind).await?;
                for status in &statuses {
                    for script in &status.scripts {
                        info!(
                            database = %status.database,
                            script = %script.name,
                            applied = script.applied,
                            "Script status"
                        );
                    }
                }
                statuses
                    .into_iter()
                    .map(|s| RunReport {
                        database: s.database,
                        ..RunReport::default()
                    })
                    .collect()
            }
        };
        for report in &reports {
            info!(
                database = %report.database,
                operation = %operation,
                applied = report.applied.len(),
                skipped = report.skipped,
                "Run finished"
            );
        }
        Ok(reports)
    }

    /// Scripts for `flavor` and `kind`, in apply order. Master migrations
    /// start with the built-in registry units.
    pub async fn scripts(&self, flavor: Flavor, kind: ScriptKind) -> DbResult<Vec<Script>> {
        let dir = self
            .scripts_dir
            .join(kind.dir_name())
            .join(flavor.dir_name());
        let mut scripts = match (flavor, kind) {
            (Flavor::Master, ScriptKind::Migration) => builtin::master_units(),
            _ => Vec::new(),
        };
        scripts.extend(load_dir(&dir).await?.into_iter().map(Script::from));
        debug!(dir = %dir.display(), count = scripts.len(), "Loaded scripts");
        Ok(scripts)
    }

    /// Databases a run of `flavor` targets.
    pub async fn targets(&self, flavor: Flavor) -> DbResult<Vec<String>> {
        match flavor {
            Flavor::Master => Ok(vec![self.master_database.clone()]),
            Flavor::Tenant => {
                let registry = self
                    .db
                    .query(TENANT_DATABASES_SQL, &[], Some(&self.master_database))
                    .await?;
                let mut databases = Vec::new();
                for row in &registry.rows {
                    match column_string(row, "db_name").filter(|n| !n.trim().is_empty()) {
                        Some(name) => {
                            // Registry names are identifiers on every engine, never paths.
                            let name = name.trim().to_string();
                            validate_database_name(&name)?;
                            databases.push(name);
                        }
                        None => warn!(
                            tenant_id = ?column_string(row, "tenant_id"),
                            "Tenant has no db_name, skipping"
                        ),
                    }
                }
                Ok(databases)
            }
        }
    }

    /// Apply every untracked script to every target database.
    pub async fn apply(&self, flavor: Flavor, kind: ScriptKind) -> DbResult<Vec<RunReport>> {
        let scripts = self.scripts(flavor, kind).await?;
        let adapter = self.db.manager().adapter().await?;
        let mut reports = Vec::new();
        for database in self.targets(flavor).await? {
            ensure_database(adapter.as_ref(), &database).await?;
            reports.push(self.apply_to(&database, kind, &scripts, adapter.dialect()).await?);
        }
        Ok(reports)
    }

    async fn apply_to(
        &self,
        database: &str,
        kind: ScriptKind,
        scripts: &[Script],
        dialect: Dialect,
    ) -> DbResult<RunReport> {
        let table = kind.tracking_table();
        self.db
            .query(&dialect.tracking_table_sql(table), &[], Some(database))
            .await?;
        let tracked = self.tracked(database, table, dialect).await?;

        let mut report = RunReport {
            database: database.to_string(),
            ..RunReport::default()
        };
        let insert = dialect.render(&format!(
            "INSERT INTO {} (name) VALUES (?)",
            dialect.quote_ident(table)
        ));
        for script in scripts {
            if tracked.contains(&script.name) {
                report.skipped += 1;
                continue;
            }
            info!(database = %database, script = %script.name, "Applying script");
            let unit = Arc::clone(&script.unit);
            let name = script.name.clone();
            let insert = insert.clone();
            self.db
                .with_transaction(
                    move |client| {
                        Box::pin(async move {
                            unit.up(client).await?;
                            client.query(&insert, &[QueryParam::from(name)]).await?;
                            Ok(())
                        })
                    },
                    Some(database),
                )
                .await
                .map_err(|e| DbError::migration(script.name.as_str(), e.to_string()))?;
            report.applied.push(script.name.clone());
        }
        Ok(report)
    }

    /// Revert every tracked script in reverse order on every target.
    pub async fn rollback(&self, flavor: Flavor, kind: ScriptKind) -> DbResult<Vec<RunReport>> {
        let scripts = self.scripts(flavor, kind).await?;
        let dialect = self.db.manager().adapter().await?.dialect();
        let mut reports = Vec::new();
        for database in self.targets(flavor).await? {
            reports.push(self.rollback_on(&database, kind, &scripts, dialect).await?);
        }
        Ok(reports)
    }

    async fn rollback_on(
        &self,
        database: &str,
        kind: ScriptKind,
        scripts: &[Script],
        dialect: Dialect,
    ) -> DbResult<RunReport> {
        let table = kind.tracking_table();
        self.db
            .query(&dialect.tracking_table_sql(table), &[], Some(database))
            .await?;
        let tracked = self.tracked(database, table, dialect).await?;

        let mut report = RunReport {
            database: database.to_string(),
            ..RunReport::default()
        };
        let delete = dialect.render(&format!(
            "DELETE FROM {} WHERE name = ?",
            dialect.quote_ident(table)
        ));
        for script in scripts.iter().rev() {
            if !tracked.contains(&script.name) {
                report.skipped += 1;
                continue;
            }
            info!(database = %database, script = %script.name, "Reverting script");
            let unit = Arc::clone(&script.unit);
            let name = script.name.clone();
            let delete = delete.clone();
            self.db
                .with_transaction(
                    move |client| {
                        Box::pin(async move {
                            unit.down(client).await?;
                            client.query(&delete, &[QueryParam::from(name)]).await?;
                            Ok(())
                        })
                    },
                    Some(database),
                )
                .await
                .map_err(|e| DbError::migration(script.name.as_str(), e.to_string()))?;
            report.applied.push(script.name.clone());
        }

        let known: HashSet<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        for orphan in tracked.iter().filter(|name| !known.contains(name.as_str())) {
            warn!(database = %database, script = %orphan, "Tracked script has no source, left in place");
        }
        Ok(report)
    }

    /// Revert every migration, drop the tracking table, then drop each
    /// target database.
    pub async fn reset(&self, flavor: Flavor) -> DbResult<Vec<RunReport>> {
        let kind = ScriptKind::Migration;
        let scripts = self.scripts(flavor, kind).await?;
        let adapter = self.db.manager().adapter().await?;
        let dialect = adapter.dialect();
        let mut reports = Vec::new();
        for database in self.targets(flavor).await? {
            let report = self.rollback_on(&database, kind, &scripts, dialect).await?;
            self.db
                .query(
                    &dialect.drop_table_sql(kind.tracking_table()),
                    &[],
                    Some(&database),
                )
                .await?;
            check_database_name(adapter.driver(), &database)?;
            adapter.drop_database(&database).await?;
            info!(database = %database, "Database dropped");
            reports.push(report);
        }
        Ok(reports)
    }

    /// Applied and pending scripts per target database. Nothing is created:
    /// a database without a tracking table reports every script as pending.
    pub async fn status(&self, flavor: Flavor, kind: ScriptKind) -> DbResult<Vec<StatusReport>> {
        let scripts = self.scripts(flavor, kind).await?;
        let dialect = self.db.manager().adapter().await?.dialect();
        let mut reports = Vec::new();
        for database in self.targets(flavor).await? {
            let tracked = match self.tracked(&database, kind.tracking_table(), dialect).await {
                Ok(tracked) => tracked,
                Err(e) => {
                    debug!(database = %database, error = %e, "No tracking data");
                    HashSet::new()
                }
            };
            reports.push(StatusReport {
                database,
                scripts: scripts
                    .iter()
                    .map(|s| ScriptStatus {
                        name: s.name.clone(),
                        applied: tracked.contains(&s.name),
                    })
                    .collect(),
            });
        }
        Ok(reports)
    }

    async fn tracked(&self, database: &str, table: &str, dialect: Dialect) -> DbResult<HashSet<String>> {
        let sql = format!("SELECT name FROM {}", dialect.quote_ident(table));
        let rows = self.db.query(&sql, &[], Some(database)).await?;
        Ok(rows
            .rows
            .iter()
            .filter_map(|row| column_string(row, "name"))
            .collect())
    }
}

async fn ensure_database(adapter: &dyn DriverAdapter, database: &str) -> DbResult<()> {
    check_database_name(adapter.driver(), database)?;
    adapter.create_database(database).await?;
    debug!(database = %database, "Database ensured");
    Ok(())
}

/// Server databases are interpolated into DDL; SQLite names are file paths.
fn check_database_name(driver: DriverKind, database: &str) -> DbResult<()> {
    if driver == DriverKind::Sqlite {
        return Ok(());
    }
    validate_database_name(database)
}
