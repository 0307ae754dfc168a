//! Data models for tenant-db.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod tenant;

// Re-export commonly used types
pub use connection::{DbConfig, DriverKind, PoolLimits};
pub use query::{QueryParam, QueryResult, RawResult, Row, column_i64, column_string};
pub use tenant::{Tenant, TenantRegistryRow, TenantUserRow, parse_flag};
