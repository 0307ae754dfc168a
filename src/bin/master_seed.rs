//! Runs master database seeds (seed|rollback|status).

use std::process::ExitCode;
use tenant_db::cli::{Target, run};

#[tokio::main]
async fn main() -> ExitCode {
    run(Target::MasterSeed).await
}
