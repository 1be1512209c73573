use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};

use crate::audit::store::{AuditStore, AuditStoreError};
use crate::audit::types::{ConfigChangeEvent, ConfigEventKind};
use crate::config_store::store::{ConfigStore, ConfigStoreError};
use crate::config_store::types::{ConfigVersionRow, DEFAULT_OVERRIDE_PRIORITY, UserOverrideRow};

#[derive(Debug, thiserror::Error)]
pub enum ConfigAdminError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("audit error: {0}")]
    Audit(#[from] AuditStoreError),
}

impl ConfigAdminError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Store(_) | Self::Audit(_) => "internal_error",
        }
    }
}

impl From<ConfigStoreError> for ConfigAdminError {
    fn from(error: ConfigStoreError) -> Self {
        match error {
            ConfigStoreError::Conflict(message) => Self::Conflict(message),
            ConfigStoreError::NotFound(message) => Self::NotFound(message),
            ConfigStoreError::Db(message) => Self::Store(message),
        }
    }
}

/// Operator-facing mutations over config versions and user overrides.
/// Every mutation lands a ConfigChangeEvent in the audit sink.
#[derive(Clone)]
pub struct ConfigAdmin {
    store: Arc<dyn ConfigStore>,
    audit: Arc<dyn AuditStore>,
}

impl ConfigAdmin {
    pub fn new(store: Arc<dyn ConfigStore>, audit: Arc<dyn AuditStore>) -> Self {
        Self { store, audit }
    }

    /// Insert a new immutable version, inactive. Activation is a separate,
    /// explicit step.
    pub async fn publish_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
        payload: Value,
        created_by: &str,
        description: Option<String>,
    ) -> Result<ConfigVersionRow, ConfigAdminError> {
        if config_key.is_empty() || version.is_empty() {
            return Err(ConfigAdminError::InvalidRequest(
                "config_key and version must be non-empty".to_string(),
            ));
        }
        let row = ConfigVersionRow {
            config_key: config_key.to_string(),
            version: version.to_string(),
            environment: environment.to_string(),
            payload,
            active: false,
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            description,
        };
        self.store.insert_version(row.clone()).await?;
        self.audit
            .append_config_event(&ConfigChangeEvent::new(
                environment,
                ConfigEventKind::VersionPublished,
                config_key,
                json!({ "version": version, "created_by": created_by }),
            ))
            .await?;
        tracing::info!(config_key, version, environment, "config version published");
        Ok(row)
    }

    /// Atomically swap the active version for (key, environment).
    pub async fn activate_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<(), ConfigAdminError> {
        self.store
            .activate_version(config_key, version, environment)
            .await?;
        self.audit
            .append_config_event(&ConfigChangeEvent::new(
                environment,
                ConfigEventKind::VersionActivated,
                config_key,
                json!({ "version": version }),
            ))
            .await?;
        tracing::info!(config_key, version, environment, "config version activated");
        Ok(())
    }

    pub async fn set_user_override(
        &self,
        environment: &str,
        user_id: &str,
        config_key: &str,
        value: Value,
        priority: Option<i32>,
        ttl_hours: Option<i64>,
        tag: Option<String>,
    ) -> Result<UserOverrideRow, ConfigAdminError> {
        if user_id.is_empty() || config_key.is_empty() {
            return Err(ConfigAdminError::InvalidRequest(
                "user_id and config_key must be non-empty".to_string(),
            ));
        }
        let now = Utc::now();
        let row = UserOverrideRow {
            user_id: user_id.to_string(),
            config_key: config_key.to_string(),
            value,
            priority: priority.unwrap_or(DEFAULT_OVERRIDE_PRIORITY),
            expires_at: ttl_hours.map(|hours| now + Duration::hours(hours)),
            tag,
            updated_at: now,
        };
        self.store.upsert_override(row.clone()).await?;
        self.audit
            .append_config_event(&ConfigChangeEvent::new(
                environment,
                ConfigEventKind::OverrideUpserted,
                config_key,
                json!({
                    "user_id": user_id,
                    "priority": row.priority,
                    "expires_at": row.expires_at,
                    "tag": row.tag,
                }),
            ))
            .await?;
        Ok(row)
    }
}
