use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use crate::ab::types::{OverrideGroupRequest, OverrideGroupSummary};
use crate::audit::store::{AuditStore, AuditStoreError};
use crate::audit::types::{ConfigChangeEvent, ConfigEventKind};
use crate::config_store::store::{ConfigStore, ConfigStoreError};
use crate::config_store::types::{AB_OVERRIDE_PRIORITY, UserOverrideRow};

#[derive(Debug, thiserror::Error)]
pub enum AbTestError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("audit error: {0}")]
    Audit(#[from] AuditStoreError),
}

impl AbTestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) | Self::Audit(_) => "internal_error",
        }
    }
}

impl From<ConfigStoreError> for AbTestError {
    fn from(error: ConfigStoreError) -> Self {
        Self::Store(error.to_string())
    }
}

/// Time-bounded override groups over the ordinary override store. Group
/// members are tagged rows at elevated precedence; nothing here is a
/// separate store.
#[derive(Clone)]
pub struct AbTestHelper {
    store: Arc<dyn ConfigStore>,
    audit: Arc<dyn AuditStore>,
    environment: String,
}

impl AbTestHelper {
    pub fn new(store: Arc<dyn ConfigStore>, audit: Arc<dyn AuditStore>, environment: &str) -> Self {
        Self {
            store,
            audit,
            environment: environment.to_string(),
        }
    }

    /// Upsert one tagged, expiring override per user. Returns the number of
    /// members enrolled.
    pub async fn create_override_group(
        &self,
        request: OverrideGroupRequest,
    ) -> Result<usize, AbTestError> {
        if request.test_name.is_empty() || request.base_config_key.is_empty() {
            return Err(AbTestError::InvalidRequest(
                "test_name and base_config_key must be non-empty".to_string(),
            ));
        }
        if request.user_ids.is_empty() {
            return Err(AbTestError::InvalidRequest("user_ids must be non-empty".to_string()));
        }
        if request.duration_days <= 0 {
            return Err(AbTestError::InvalidRequest(
                "duration_days must be positive".to_string(),
            ));
        }
        if !request.overrides.is_object() {
            return Err(AbTestError::InvalidRequest(
                "overrides must be an object".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = now + Duration::days(request.duration_days);
        for user_id in &request.user_ids {
            self.store
                .upsert_override(UserOverrideRow {
                    user_id: user_id.clone(),
                    config_key: request.base_config_key.clone(),
                    value: request.overrides.clone(),
                    priority: AB_OVERRIDE_PRIORITY,
                    expires_at: Some(expires_at),
                    tag: Some(request.test_name.clone()),
                    updated_at: now,
                })
                .await?;
        }

        self.audit
            .append_config_event(&ConfigChangeEvent::new(
                &self.environment,
                ConfigEventKind::OverrideUpserted,
                &request.base_config_key,
                json!({
                    "test_name": request.test_name,
                    "members": request.user_ids.len(),
                    "expires_at": expires_at,
                }),
            ))
            .await?;
        tracing::info!(
            test_name = %request.test_name,
            config_key = %request.base_config_key,
            members = request.user_ids.len(),
            "override group created"
        );
        Ok(request.user_ids.len())
    }

    /// Aggregate tagged overrides by test name: size, earliest enrollment,
    /// latest expiry, and whether any member is still unexpired.
    pub async fn list_groups(&self) -> Result<Vec<OverrideGroupSummary>, AbTestError> {
        let now = Utc::now();
        let mut groups: BTreeMap<String, OverrideGroupSummary> = BTreeMap::new();
        for row in self.store.list_tagged_overrides().await? {
            let Some(tag) = row.tag.clone() else {
                continue;
            };
            let entry = groups.entry(tag.clone()).or_insert(OverrideGroupSummary {
                test_name: tag,
                config_key: row.config_key.clone(),
                size: 0,
                started_at: row.updated_at,
                expires_at: row.expires_at,
                active: false,
            });
            entry.size += 1;
            if row.updated_at < entry.started_at {
                entry.started_at = row.updated_at;
            }
            if row.expires_at > entry.expires_at {
                entry.expires_at = row.expires_at;
            }
            if !row.is_expired(now) {
                entry.active = true;
            }
        }
        Ok(groups.into_values().collect())
    }

    /// Delete expired override rows and report the count. Resolution never
    /// calls this; it simply ignores expired rows.
    pub async fn sweep_expired(&self) -> Result<u64, AbTestError> {
        let removed = self.store.delete_expired_overrides(Utc::now()).await?;
        if removed > 0 {
            self.audit
                .append_config_event(&ConfigChangeEvent::new(
                    &self.environment,
                    ConfigEventKind::OverridesSwept,
                    "user_config_overrides",
                    json!({ "removed": removed }),
                ))
                .await?;
        }
        tracing::info!(removed, "expired overrides swept");
        Ok(removed)
    }
}
