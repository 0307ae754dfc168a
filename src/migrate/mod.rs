//! Versioned migrations and seeds.
//!
//! Scripts are loaded from disk (see [`script`]) or registered in code (see
//! [`builtin`]), wrapped as [`unit::Script`] values and applied per database
//! by the [`orchestrator`].

pub mod builtin;
pub mod orchestrator;
pub mod script;
pub mod unit;

pub use orchestrator::{
    Flavor, Operation, Orchestrator, RunReport, ScriptKind, ScriptStatus, StatusReport,
};
pub use script::{ScriptFile, SqlScript};
pub use unit::{MigrationUnit, Script, SqlUnit};
