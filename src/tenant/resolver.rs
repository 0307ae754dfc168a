//! Email to tenant resolution.
//!
//! Looks the email up in the master database's `tenant_users` mapping, then
//! loads the tenant's row from the `tenants` registry and builds its
//! connection descriptor. Ambiguous or incomplete data is always an error;
//! the resolver never guesses.

use crate::context;
use crate::database::Database;
use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{DriverKind, QueryParam, Tenant, TenantRegistryRow, column_string};
use std::sync::Arc;
use tracing::{debug, info};

const USER_LOOKUP_SQL: &str = "SELECT email, tenant_id FROM tenant_users WHERE email = ?";
const TENANT_LOOKUP_SQL: &str = "SELECT tenant_id, db_host, db_port, db_user, db_pass, db_name, db_ssl FROM tenants WHERE tenant_id = ?";

/// Per-call options for [`TenantResolver::resolve_with`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Master database to read from instead of the resolver's default.
    pub master_database: Option<String>,
    /// Bind the flow's database context to the tenant's database.
    pub bind_context: bool,
}

pub struct TenantResolver {
    db: Arc<Database>,
    driver: DriverKind,
    master_database: String,
}

impl TenantResolver {
    /// `driver` is the engine tenant databases run on; it names the
    /// descriptor scheme and the placeholder syntax of the lookups.
    pub fn new(db: Arc<Database>, driver: DriverKind, master_database: impl Into<String>) -> Self {
        Self {
            db,
            driver,
            master_database: master_database.into(),
        }
    }

    /// Resolve `email` against the default master database.
    pub async fn resolve(&self, email: &str) -> DbResult<Tenant> {
        self.resolve_with(email, ResolveOptions::default()).await
    }

    pub async fn resolve_with(&self, email: &str, options: ResolveOptions) -> DbResult<Tenant> {
        let master = options
            .master_database
            .as_deref()
            .unwrap_or(&self.master_database);
        let (tenant, database) = self.lookup(email, master).await.map_err(|e| {
            let cause = match e {
                DbError::InvalidInput { message } => message,
                other => other.to_string(),
            };
            DbError::tenant_resolution(email, cause)
        })?;

        if options.bind_context {
            context::set_current(database.as_str())
                .map_err(|e| DbError::tenant_resolution(email, e.to_string()))?;
            debug!(tenant_id = %tenant.id, database = %database, "Bound database context to tenant");
        }
        Ok(tenant)
    }

    async fn lookup(&self, email: &str, master: &str) -> DbResult<(Tenant, String)> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(DbError::invalid_input("valid email required"));
        }

        let dialect = Dialect::new(self.driver);
        let users = self
            .db
            .query(
                &dialect.render(USER_LOOKUP_SQL),
                &[QueryParam::from(email.as_str())],
                Some(master),
            )
            .await?;
        let tenant_id = match users.rows.as_slice() {
            [] => return Err(DbError::invalid_input("no tenant associated with email")),
            [row] => column_string(row, "tenant_id")
                .ok_or_else(|| DbError::invalid_input("no tenant associated with email"))?,
            _ => {
                return Err(DbError::invalid_input(
                    "multiple tenants found, contact support",
                ));
            }
        };

        let tenants = self
            .db
            .query(
                &dialect.render(TENANT_LOOKUP_SQL),
                &[QueryParam::from(tenant_id.as_str())],
                Some(master),
            )
            .await?;
        let row = tenants
            .first()
            .and_then(TenantRegistryRow::from_row)
            .ok_or_else(|| DbError::invalid_input("tenant not found"))?;

        let missing = row.missing_fields();
        if !missing.is_empty() {
            return Err(DbError::invalid_input(format!(
                "incomplete configuration: missing {}",
                missing.join(", ")
            )));
        }
        let db_connection = row
            .connection_descriptor(self.driver)
            .ok_or_else(|| DbError::invalid_input("incomplete configuration: invalid db_host or db_port"))?;
        let database = row.db_name.clone().unwrap_or_default().trim().to_string();

        info!(tenant_id = %row.tenant_id, database = %database, "Tenant resolved");
        Ok((
            Tenant {
                id: row.tenant_id,
                db_connection,
            },
            database,
        ))
    }
}
