//! Configuration handling for tenant-db.
//!
//! Database profiles are read from environment variables named
//! `{PREFIX}_{DRIVER,HOST,PORT,USER,PASS,NAME,SSL}` for the prefixes `DB`,
//! `MASTER_DB`, `SANDBOX_DB` and `BLUE_DB`. The lookup function is injectable
//! so that settings can be built from any source in tests.
//!
//! Command-line entry points parse [`CliConfig`] via clap.

use crate::error::{DbError, DbResult};
use crate::models::{DbConfig, DriverKind, PoolLimits, parse_flag};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_CONNECTION_LIMIT: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

// Production-like defaults
pub const PRODUCTION_CONNECTION_LIMIT: u32 = 50;
pub const PRODUCTION_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const PRODUCTION_IDLE_TIMEOUT_SECS: u64 = 300;

/// Backoff before the single init retry in production-like mode.
pub const PRODUCTION_INIT_BACKOFF_SECS: u64 = 5;

pub const DEFAULT_SCRIPTS_DIR: &str = "scripts";

/// Deployment environment, read from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl AppEnv {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" => Self::Staging,
            "test" => Self::Test,
            _ => Self::Development,
        }
    }

    /// Production-like environments get larger pools and an init retry.
    pub fn is_production_like(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

impl std::fmt::Display for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Named database profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Profile {
    /// Routed by `TENANCY`: master when enabled, `DB_*` otherwise.
    #[default]
    Default,
    /// `MASTER_DB_*`
    Master,
    /// `SANDBOX_DB_*`
    Sandbox,
    /// `BLUE_DB_*`
    Blue,
}

impl Profile {
    /// Environment variable prefix for this profile.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Default => "DB",
            Self::Master => "MASTER_DB",
            Self::Sandbox => "SANDBOX_DB",
            Self::Blue => "BLUE_DB",
        }
    }
}

/// Settings read once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app_env: AppEnv,
    /// When true the default-routed database is the master database.
    pub tenancy: bool,
    pub pool: PoolLimits,
    /// `DB_*`; required when tenancy is off.
    pub db: Option<DbConfig>,
    /// `MASTER_DB_*`; required when tenancy is on.
    pub master_db: Option<DbConfig>,
    pub sandbox_db: Option<DbConfig>,
    pub blue_db: Option<DbConfig>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> DbResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which returns the value of a variable.
    pub fn from_lookup<F>(lookup: F) -> DbResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let app_env = get("APP_ENV").map(|v| AppEnv::parse(&v)).unwrap_or_default();
        let tenancy = get("TENANCY").is_some_and(|v| parse_flag(&v));
        let pool = pool_limits(&get, app_env)?;

        let profile = |prefix: &str, required: bool| -> DbResult<Option<DbConfig>> {
            if !required && get(&format!("{}_DRIVER", prefix)).is_none() {
                return Ok(None);
            }
            db_config_from(&get, prefix, &pool).map(Some)
        };

        Ok(Self {
            app_env,
            tenancy,
            db: profile("DB", !tenancy)?,
            master_db: profile("MASTER_DB", tenancy)?,
            sandbox_db: profile("SANDBOX_DB", false)?,
            blue_db: profile("BLUE_DB", false)?,
            pool,
        })
    }

    /// Get the config for a profile, or a configuration error if it is not set.
    pub fn profile(&self, profile: Profile) -> DbResult<&DbConfig> {
        let config = match profile {
            Profile::Default if self.tenancy => self.master_db.as_ref(),
            Profile::Default => self.db.as_ref(),
            Profile::Master => self.master_db.as_ref(),
            Profile::Sandbox => self.sandbox_db.as_ref(),
            Profile::Blue => self.blue_db.as_ref(),
        };
        config.ok_or_else(|| {
            DbError::configuration(format!(
                "database profile {}_* is not configured",
                match profile {
                    Profile::Default if self.tenancy => "MASTER_DB",
                    other => other.env_prefix(),
                }
            ))
        })
    }

    /// Database name the façade routes to when neither an override nor a
    /// tenant context is present.
    pub fn default_database(&self) -> DbResult<String> {
        Ok(self.profile(Profile::Default)?.database.clone())
    }

    /// Config of the master database (falls back to `DB_*` without tenancy).
    pub fn master(&self) -> DbResult<&DbConfig> {
        self.master_db
            .as_ref()
            .or(self.db.as_ref())
            .ok_or_else(|| DbError::configuration("MASTER_DB_DRIVER is required"))
    }
}

fn pool_limits<G>(get: &G, app_env: AppEnv) -> DbResult<PoolLimits>
where
    G: Fn(&str) -> Option<String>,
{
    let production = app_env.is_production_like();
    let connection_limit = match get("DB_CONNECTION_LIMIT") {
        Some(v) => parse_number::<u32>("DB_CONNECTION_LIMIT", &v)?,
        None if production => PRODUCTION_CONNECTION_LIMIT,
        None => DEFAULT_CONNECTION_LIMIT,
    };
    let acquire_timeout = match get("DB_ACQUIRE_TIMEOUT") {
        Some(v) => parse_number::<u64>("DB_ACQUIRE_TIMEOUT", &v)?,
        None if production => PRODUCTION_ACQUIRE_TIMEOUT_SECS,
        None => DEFAULT_ACQUIRE_TIMEOUT_SECS,
    };
    let idle_timeout = match get("DB_IDLE_TIMEOUT") {
        Some(v) => parse_number::<u64>("DB_IDLE_TIMEOUT", &v)?,
        None if production => PRODUCTION_IDLE_TIMEOUT_SECS,
        None => DEFAULT_IDLE_TIMEOUT_SECS,
    };
    if connection_limit == 0 {
        return Err(DbError::configuration(
            "DB_CONNECTION_LIMIT must be greater than 0",
        ));
    }
    Ok(PoolLimits {
        connection_limit,
        acquire_timeout: Duration::from_secs(acquire_timeout),
        idle_timeout: Duration::from_secs(idle_timeout),
    })
}

fn db_config_from<G>(get: &G, prefix: &str, pool: &PoolLimits) -> DbResult<DbConfig>
where
    G: Fn(&str) -> Option<String>,
{
    let var = |name: &str| format!("{}_{}", prefix, name);
    let require = |name: &str| {
        get(&var(name))
            .ok_or_else(|| DbError::configuration(format!("{} is required", var(name))))
    };

    let driver: DriverKind = require("DRIVER")?
        .parse()
        .map_err(|e: DbError| DbError::configuration(format!("{}: {}", var("DRIVER"), e)))?;
    let database = require("NAME")?;

    let mut config = if driver == DriverKind::Sqlite {
        DbConfig::sqlite(database)
    } else {
        let host = require("HOST")?;
        let port = match get(&var("PORT")) {
            Some(v) => parse_number::<u16>(&var("PORT"), &v)?,
            None => driver.default_port().unwrap_or(0),
        };
        DbConfig::new(driver, host, database)
            .with_port(port)
            .with_credentials(get(&var("USER")).unwrap_or_default(), get(&var("PASS")))
    };
    config = config
        .with_ssl(get(&var("SSL")).is_some_and(|v| parse_flag(&v)))
        .with_pool(pool.clone());
    config.validate().map_err(|e| match e {
        DbError::Configuration { message } => {
            DbError::configuration(format!("{}_*: {}", prefix, message))
        }
        other => other,
    })?;
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> DbResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DbError::configuration(format!("{} must be a number, got '{}'", name, value)))
}

/// Command-line configuration shared by the migration and seed entry points.
#[derive(Debug, Clone, Parser)]
#[command(version, author)]
pub struct CliConfig {
    /// Operation to run (e.g. migrate, reset, seed, rollback)
    pub operation: String,

    /// Database profile to connect with
    #[arg(long, value_enum, default_value = "default", env = "DB_PROFILE")]
    pub profile: Profile,

    /// Directory holding `migrations/` and `seeds/` script folders
    #[arg(long, default_value = DEFAULT_SCRIPTS_DIR, env = "SCRIPTS_DIR")]
    pub scripts_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const MYSQL_DB: &[(&str, &str)] = &[
        ("DB_DRIVER", "mysql"),
        ("DB_HOST", "localhost"),
        ("DB_USER", "app"),
        ("DB_PASS", "secret"),
        ("DB_NAME", "app_db"),
    ];

    #[test]
    fn test_single_tenant_settings() {
        let settings = Settings::from_lookup(lookup(MYSQL_DB)).unwrap();
        assert!(!settings.tenancy);
        let db = settings.profile(Profile::Default).unwrap();
        assert_eq!(db.driver, DriverKind::MySql);
        assert_eq!(db.port, 3306);
        assert_eq!(db.password.as_deref(), Some("secret"));
        assert_eq!(settings.default_database().unwrap(), "app_db");
        assert!(settings.sandbox_db.is_none());
    }

    #[test]
    fn test_tenancy_routes_default_to_master() {
        let settings = Settings::from_lookup(lookup(&[
            ("TENANCY", "true"),
            ("MASTER_DB_DRIVER", "postgres"),
            ("MASTER_DB_HOST", "pg.internal"),
            ("MASTER_DB_PORT", "6432"),
            ("MASTER_DB_USER", "root"),
            ("MASTER_DB_NAME", "master"),
            ("MASTER_DB_SSL", "true"),
        ]))
        .unwrap();
        assert!(settings.tenancy);
        assert!(settings.db.is_none());
        let default = settings.profile(Profile::Default).unwrap();
        assert_eq!(default.database, "master");
        assert_eq!(default.port, 6432);
        assert!(default.ssl);
        assert!(default.password.is_none());
    }

    #[test]
    fn test_missing_required_variable() {
        let err = Settings::from_lookup(lookup(&[("DB_DRIVER", "mysql")])).unwrap_err();
        assert!(err.to_string().contains("DB_NAME is required"));
    }

    #[test]
    fn test_unsupported_driver_is_configuration_error() {
        let err = Settings::from_lookup(lookup(&[
            ("DB_DRIVER", "oracle"),
            ("DB_HOST", "h"),
            ("DB_NAME", "n"),
        ]))
        .unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(err.to_string().contains("unsupported driver"));
    }

    #[test]
    fn test_invalid_port() {
        let mut vars = MYSQL_DB.to_vec();
        vars.push(("DB_PORT", "not-a-port"));
        let err = Settings::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("DB_PORT"));
    }

    #[test]
    fn test_production_pool_defaults() {
        let mut vars = MYSQL_DB.to_vec();
        vars.push(("APP_ENV", "production"));
        let settings = Settings::from_lookup(lookup(&vars)).unwrap();
        assert!(settings.app_env.is_production_like());
        assert_eq!(settings.pool.connection_limit, PRODUCTION_CONNECTION_LIMIT);
        assert_eq!(
            settings.pool.acquire_timeout,
            Duration::from_secs(PRODUCTION_ACQUIRE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_pool_overrides() {
        let mut vars = MYSQL_DB.to_vec();
        vars.push(("DB_CONNECTION_LIMIT", "3"));
        vars.push(("DB_IDLE_TIMEOUT", "15"));
        let settings = Settings::from_lookup(lookup(&vars)).unwrap();
        let db = settings.profile(Profile::Default).unwrap();
        assert_eq!(db.pool.connection_limit, 3);
        assert_eq!(db.pool.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_connection_limit_rejected() {
        let mut vars = MYSQL_DB.to_vec();
        vars.push(("DB_CONNECTION_LIMIT", "0"));
        assert!(Settings::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn test_optional_profiles() {
        let mut vars = MYSQL_DB.to_vec();
        vars.push(("SANDBOX_DB_DRIVER", "sqlite"));
        vars.push(("SANDBOX_DB_NAME", "/tmp/sandbox.sqlite"));
        let settings = Settings::from_lookup(lookup(&vars)).unwrap();
        let sandbox = settings.profile(Profile::Sandbox).unwrap();
        assert_eq!(sandbox.driver, DriverKind::Sqlite);
        assert!(settings.profile(Profile::Blue).is_err());
    }

    #[test]
    fn test_app_env_parse() {
        assert_eq!(AppEnv::parse("PROD"), AppEnv::Production);
        assert_eq!(AppEnv::parse("staging"), AppEnv::Staging);
        assert_eq!(AppEnv::parse("anything"), AppEnv::Development);
        assert!(!AppEnv::Test.is_production_like());
    }
}
