use std::env;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

use crate::features::types::DependencyPolicy;
use crate::migration::coordinator::DEFAULT_ROLLBACK_RECENCY_HOURS;
use crate::migration::schema::Ident;

/// Service-level configuration, read once from the environment at startup.
/// This is the configuration *of* the engine; the documents it serves live
/// in the store.
#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    /// Environment scope this instance operates in ("production",
    /// "staging", ...). All admin-surface operations apply to it.
    pub environment: String,
    /// Postgres backend when set; in-memory stores otherwise.
    pub db_url: Option<String>,
    /// Schema holding the engine's tables and provisioned capability
    /// objects.
    pub schema_name: String,
    /// Optional directory of fallback config documents (yml/yaml/json).
    pub fallback_dir: Option<PathBuf>,
    /// Prefix of the `PREFIX__CONFIG_KEY__PATH=value` override convention.
    pub env_override_prefix: String,
    pub dependency_policy: DependencyPolicy,
    /// Built-in rollback safety window; still overridable per feature
    /// through the parameter chain.
    pub rollback_recency_hours: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CONFIGD_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid CONFIGD_SCHEMA: {0}")]
    InvalidSchemaName(String),
    #[error("invalid CONFIGD_DEPENDENCY_POLICY: {0}")]
    InvalidDependencyPolicy(String),
    #[error("invalid CONFIGD_ROLLBACK_RECENCY_HOURS: {0}")]
    InvalidRollbackRecencyHours(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("CONFIGD_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("CONFIGD_SERVICE_NAME").unwrap_or_else(|_| "configd".to_string());
        let environment =
            env::var("CONFIGD_ENVIRONMENT").unwrap_or_else(|_| "production".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let schema_name = env::var("CONFIGD_SCHEMA").unwrap_or_else(|_| "companion".to_string());
        Ident::new(&schema_name)
            .map_err(|error| ConfigError::InvalidSchemaName(error.to_string()))?;
        let fallback_dir = env::var("CONFIGD_FALLBACK_DIR").ok().map(PathBuf::from);
        let env_override_prefix =
            env::var("CONFIGD_ENV_OVERRIDE_PREFIX").unwrap_or_else(|_| "COMPANION".to_string());
        let dependency_policy_raw = env::var("CONFIGD_DEPENDENCY_POLICY")
            .unwrap_or_else(|_| DependencyPolicy::Advisory.as_str().to_string());
        let dependency_policy = DependencyPolicy::parse(&dependency_policy_raw)
            .ok_or(ConfigError::InvalidDependencyPolicy(dependency_policy_raw))?;
        let rollback_recency_hours = env::var("CONFIGD_ROLLBACK_RECENCY_HOURS")
            .unwrap_or_else(|_| DEFAULT_ROLLBACK_RECENCY_HOURS.to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidRollbackRecencyHours(error.to_string()))?;

        Ok(Self {
            service_name,
            bind_addr,
            environment,
            db_url,
            schema_name,
            fallback_dir,
            env_override_prefix,
            dependency_policy,
            rollback_recency_hours,
        })
    }
}
