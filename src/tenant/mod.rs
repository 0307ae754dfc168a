//! Tenant lookup in the master database.

pub mod resolver;

pub use resolver::{ResolveOptions, TenantResolver};
