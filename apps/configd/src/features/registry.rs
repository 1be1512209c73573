use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::audit::store::{AuditStore, AuditStoreError};
use crate::audit::types::{ConfigChangeEvent, ConfigEventKind};
use crate::features::store::{FeatureStore, FeatureStoreError};
use crate::features::types::{DependencyPolicy, FeatureFlagRow};

#[derive(Debug, thiserror::Error)]
pub enum FeatureRegistryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("audit error: {0}")]
    Audit(#[from] AuditStoreError),
}

impl FeatureRegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Store(_) | Self::Audit(_) => "internal_error",
        }
    }
}

impl From<FeatureStoreError> for FeatureRegistryError {
    fn from(error: FeatureStoreError) -> Self {
        match error {
            FeatureStoreError::NotFound(message) => Self::NotFound(message),
            FeatureStoreError::Db(message) => Self::Store(message),
        }
    }
}

/// Availability checks and operator toggles over feature flags.
#[derive(Clone)]
pub struct FeatureRegistry {
    store: Arc<dyn FeatureStore>,
    audit: Arc<dyn AuditStore>,
    dependency_policy: DependencyPolicy,
}

impl FeatureRegistry {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        audit: Arc<dyn AuditStore>,
        dependency_policy: DependencyPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            dependency_policy,
        }
    }

    pub fn store(&self) -> Arc<dyn FeatureStore> {
        self.store.clone()
    }

    pub fn dependency_policy(&self) -> DependencyPolicy {
        self.dependency_policy
    }

    /// False when the flag is absent or disabled. Unsatisfied dependencies
    /// block availability only under the enforce policy; under advisory they
    /// are logged and the feature stays available.
    pub async fn is_available(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<bool, FeatureRegistryError> {
        let Some(flag) = self.store.get_flag(feature_name, environment).await? else {
            return Ok(false);
        };
        if !flag.enabled {
            return Ok(false);
        }
        let unsatisfied = self.unsatisfied_dependencies(&flag, environment).await?;
        if unsatisfied.is_empty() {
            return Ok(true);
        }
        match self.dependency_policy {
            DependencyPolicy::Advisory => {
                tracing::warn!(
                    feature = feature_name,
                    environment,
                    unsatisfied = ?unsatisfied,
                    "feature dependencies unsatisfied (advisory)"
                );
                Ok(true)
            }
            DependencyPolicy::Enforce => Ok(false),
        }
    }

    /// Declared dependencies that are currently not enabled in the same
    /// environment.
    pub async fn unsatisfied_dependencies(
        &self,
        flag: &FeatureFlagRow,
        environment: &str,
    ) -> Result<Vec<String>, FeatureRegistryError> {
        let mut unsatisfied = Vec::new();
        for dependency in &flag.dependencies {
            let satisfied = self
                .store
                .get_flag(dependency, environment)
                .await?
                .is_some_and(|row| row.enabled);
            if !satisfied {
                unsatisfied.push(dependency.clone());
            }
        }
        Ok(unsatisfied)
    }

    pub async fn get_flag(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<Option<FeatureFlagRow>, FeatureRegistryError> {
        Ok(self.store.get_flag(feature_name, environment).await?)
    }

    pub async fn upsert_flag(&self, row: FeatureFlagRow) -> Result<(), FeatureRegistryError> {
        Ok(self.store.upsert_flag(row).await?)
    }

    /// Toggle a flag; the change is immediately visible to readers and
    /// recorded in the audit sink.
    pub async fn set_enabled(
        &self,
        feature_name: &str,
        environment: &str,
        enabled: bool,
    ) -> Result<(), FeatureRegistryError> {
        self.store
            .set_enabled(feature_name, environment, enabled, Utc::now())
            .await?;
        self.audit
            .append_config_event(&ConfigChangeEvent::new(
                environment,
                ConfigEventKind::FeatureToggled,
                feature_name,
                json!({ "enabled": enabled }),
            ))
            .await?;
        tracing::info!(feature = feature_name, environment, enabled, "feature flag toggled");
        Ok(())
    }
}
