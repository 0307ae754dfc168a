//! Built-in master database units.
//!
//! The tenant registry and the user mapping are part of the library's own
//! contract with the resolver, so their DDL lives in code and is rendered per
//! engine. They run before any file script of the master flavor.

use crate::db::adapter::AdapterClient;
use crate::error::DbResult;
use crate::migrate::unit::{MigrationUnit, Script};
use crate::models::DriverKind;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const TENANTS_TABLE: &str = "tenants";
pub const TENANT_USERS_TABLE: &str = "tenant_users";
const EMAIL_INDEX: &str = "idx_tenant_users_email";

struct CreateTenants;

#[async_trait]
impl MigrationUnit for CreateTenants {
    async fn up(&self, client: &mut AdapterClient) -> DbResult<()> {
        let dialect = client.dialect();
        let ts = dialect.timestamp_type();
        let sql = dialect.create_table_sql(
            TENANTS_TABLE,
            &[
                dialect.auto_id_column().to_string(),
                "tenant_id VARCHAR(64) NOT NULL UNIQUE".to_string(),
                "db_host VARCHAR(255) NOT NULL".to_string(),
                "db_port INT NOT NULL".to_string(),
                "db_user VARCHAR(128) NOT NULL".to_string(),
                "db_pass VARCHAR(255) NULL".to_string(),
                "db_name VARCHAR(128) NOT NULL".to_string(),
                "db_ssl VARCHAR(8) NULL".to_string(),
                format!("created_at {} DEFAULT CURRENT_TIMESTAMP", ts),
                format!("updated_at {} DEFAULT CURRENT_TIMESTAMP", ts),
            ],
        );
        client.query_raw(&sql, &[]).await?;
        Ok(())
    }

    async fn down(&self, client: &mut AdapterClient) -> DbResult<()> {
        let sql = client.dialect().drop_table_sql(TENANTS_TABLE);
        client.query_raw(&sql, &[]).await?;
        Ok(())
    }
}

struct CreateTenantUsers;

#[async_trait]
impl MigrationUnit for CreateTenantUsers {
    async fn up(&self, client: &mut AdapterClient) -> DbResult<()> {
        let dialect = client.dialect();
        let sql = dialect.create_table_sql(
            TENANT_USERS_TABLE,
            &[
                dialect.auto_id_column().to_string(),
                "email VARCHAR(255) NOT NULL".to_string(),
                "tenant_id VARCHAR(64) NOT NULL".to_string(),
                format!(
                    "created_at {} DEFAULT CURRENT_TIMESTAMP",
                    dialect.timestamp_type()
                ),
            ],
        );
        client.query_raw(&sql, &[]).await?;
        ensure_email_index(client).await
    }

    async fn down(&self, client: &mut AdapterClient) -> DbResult<()> {
        let sql = client.dialect().drop_table_sql(TENANT_USERS_TABLE);
        client.query_raw(&sql, &[]).await?;
        Ok(())
    }
}

async fn ensure_email_index(client: &mut AdapterClient) -> DbResult<()> {
    let dialect = client.dialect();
    if dialect.driver() == DriverKind::MySql {
        let existing = client
            .query(
                "SELECT 1 FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
                &[TENANT_USERS_TABLE.into(), EMAIL_INDEX.into()],
            )
            .await?;
        if !existing.is_empty() {
            debug!(index = EMAIL_INDEX, "Index already present");
            return Ok(());
        }
    }
    let sql = dialect.create_index_sql(EMAIL_INDEX, TENANT_USERS_TABLE, "email");
    client.query_raw(&sql, &[]).await?;
    Ok(())
}

/// Units every master database receives, in apply order.
pub fn master_units() -> Vec<Script> {
    vec![
        Script {
            order: 0,
            name: "builtin_create_tenants".to_string(),
            unit: Arc::new(CreateTenants),
        },
        Script {
            order: 0,
            name: "builtin_create_tenant_users".to_string(),
            unit: Arc::new(CreateTenantUsers),
        },
    ]
}
