//! Runs tenant database migrations (migrate|reset|status).

use std::process::ExitCode;
use tenant_db::cli::{Target, run};

#[tokio::main]
async fn main() -> ExitCode {
    run(Target::TenantMigrate).await
}
