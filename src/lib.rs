//! tenant-db
//!
//! Data-access core for multi-tenant applications: one master database plus
//! one database per tenant, on MySQL, PostgreSQL, SQLite or SQL Server.
//!
//! - [`db`]: engine adapters and the connection manager
//! - [`database`]: the query, transaction and health façade
//! - [`context`]: flow-scoped routing to the current tenant database
//! - [`tenant`]: email to tenant resolution against the master database
//! - [`migrate`]: versioned migrations and seeds, per database

pub mod cli;
pub mod config;
pub mod context;
pub mod database;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod tenant;

pub use config::Settings;
pub use database::Database;
pub use db::{ConnectionManager, RetryPolicy};
pub use error::{DbError, DbResult};
pub use tenant::TenantResolver;
