//! Shared entry point of the migration and seed binaries.
//!
//! Each binary names its [`Target`]; the operation comes from the first
//! positional argument. Exit code 0 on success, 1 on an invalid operation or
//! any failure. The connection manager is closed before exiting.

use crate::config::{CliConfig, Settings};
use crate::database::Database;
use crate::db::manager::{ConnectionManager, RetryPolicy};
use crate::error::DbResult;
use crate::migrate::{Flavor, Operation, Orchestrator, RunReport, ScriptKind};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// What a binary manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    MasterMigrate,
    TenantMigrate,
    MasterSeed,
    TenantSeed,
}

impl Target {
    pub fn flavor(&self) -> Flavor {
        match self {
            Self::MasterMigrate | Self::MasterSeed => Flavor::Master,
            Self::TenantMigrate | Self::TenantSeed => Flavor::Tenant,
        }
    }

    pub fn kind(&self) -> ScriptKind {
        match self {
            Self::MasterMigrate | Self::TenantMigrate => ScriptKind::Migration,
            Self::MasterSeed | Self::TenantSeed => ScriptKind::Seed,
        }
    }

    /// Operations this target accepts.
    pub fn operations(&self) -> &'static [Operation] {
        match self.kind() {
            ScriptKind::Migration => &[Operation::Migrate, Operation::Reset, Operation::Status],
            ScriptKind::Seed => &[Operation::Seed, Operation::Rollback, Operation::Status],
        }
    }

    /// Parse `raw` into one of this target's operations.
    pub fn operation(&self, raw: &str) -> Option<Operation> {
        raw.parse::<Operation>()
            .ok()
            .filter(|op| self.operations().contains(op))
    }
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &CliConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Parse arguments, run the operation and map the outcome to an exit code.
pub async fn run(target: Target) -> ExitCode {
    dotenvy::dotenv().ok();
    let config = CliConfig::parse();
    init_tracing(&config);

    let Some(operation) = target.operation(&config.operation) else {
        let expected: Vec<String> = target.operations().iter().map(|o| o.to_string()).collect();
        eprintln!(
            "Error: invalid operation: {} (expected one of: {})",
            config.operation,
            expected.join(", ")
        );
        return ExitCode::FAILURE;
    };

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let manager = Arc::new(ConnectionManager::new(RetryPolicy::for_environment(
        settings.app_env.is_production_like(),
    )));
    let result = execute(&manager, &settings, &config, target, operation).await;
    if let Err(e) = manager.close().await {
        warn!(error = %e, "Failed to close connection manager");
    }

    match result {
        Ok(reports) => {
            match serde_json::to_string_pretty(&reports) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!(error = %e, "Failed to render run report"),
            }
            info!(?target, operation = %operation, "Done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(?target, operation = %operation, error = %e, "Run failed");
            eprintln!("Error: {}", e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(
    manager: &Arc<ConnectionManager>,
    settings: &Settings,
    config: &CliConfig,
    target: Target,
    operation: Operation,
) -> DbResult<Vec<RunReport>> {
    let db_config = settings.profile(config.profile)?.clone();
    let master_database = db_config.database.clone();
    info!(
        app_env = %settings.app_env,
        profile = ?config.profile,
        driver = %db_config.driver,
        "Connecting"
    );

    // The master database may not exist yet, so connect without selecting one.
    manager.initialize(db_config).await?;
    let db = Arc::new(Database::new(Arc::clone(manager), master_database.clone()));
    let orchestrator = Orchestrator::new(db, config.scripts_dir.clone(), master_database);
    orchestrator
        .run(target.flavor(), target.kind(), operation)
        .await
}
