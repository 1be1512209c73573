use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::db::Db;
use crate::features::types::FeatureFlagRow;

#[derive(Debug, thiserror::Error)]
pub enum FeatureStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Persistence seam for feature flags. Mutations are immediately visible to
/// readers; there is no caching layer to invalidate.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_flag(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<Option<FeatureFlagRow>, FeatureStoreError>;

    async fn upsert_flag(&self, row: FeatureFlagRow) -> Result<(), FeatureStoreError>;

    /// Flip the toggle on an existing flag; a missing flag is NotFound
    /// (flags are created at bootstrap, not implicitly).
    async fn set_enabled(
        &self,
        feature_name: &str,
        environment: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError>;

    /// Shallow-merge `patch`'s top-level keys into the flag's settings
    /// document (null values remove the key).
    async fn merge_settings(
        &self,
        feature_name: &str,
        environment: &str,
        patch: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError>;

    async fn list_flags(
        &self,
        environment: &str,
    ) -> Result<Vec<FeatureFlagRow>, FeatureStoreError>;
}

pub fn memory() -> Arc<dyn FeatureStore> {
    Arc::new(MemoryFeatureStore::default())
}

pub fn postgres(db: Arc<Db>) -> Arc<dyn FeatureStore> {
    Arc::new(PostgresFeatureStore { db })
}

/// Shallow settings merge shared by both implementations: top-level keys of
/// the patch replace existing keys; explicit nulls delete.
fn merge_patch(settings: &mut Value, patch: &Value) {
    if !settings.is_object() {
        *settings = Value::Object(Map::new());
    }
    let (Value::Object(target), Value::Object(entries)) = (settings, patch) else {
        return;
    };
    for (key, value) in entries {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Default)]
struct MemoryFeatureStore {
    // key: (feature_name, environment)
    inner: Mutex<HashMap<(String, String), FeatureFlagRow>>,
}

#[async_trait]
impl FeatureStore for MemoryFeatureStore {
    async fn get_flag(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<Option<FeatureFlagRow>, FeatureStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&(feature_name.to_string(), environment.to_string()))
            .cloned())
    }

    async fn upsert_flag(&self, row: FeatureFlagRow) -> Result<(), FeatureStoreError> {
        let mut inner = self.inner.lock().await;
        inner.insert((row.feature_name.clone(), row.environment.clone()), row);
        Ok(())
    }

    async fn set_enabled(
        &self,
        feature_name: &str,
        environment: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .get_mut(&(feature_name.to_string(), environment.to_string()))
            .ok_or_else(|| {
                FeatureStoreError::NotFound(format!("feature {feature_name} in {environment}"))
            })?;
        row.enabled = enabled;
        row.updated_at = now;
        Ok(())
    }

    async fn merge_settings(
        &self,
        feature_name: &str,
        environment: &str,
        patch: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .get_mut(&(feature_name.to_string(), environment.to_string()))
            .ok_or_else(|| {
                FeatureStoreError::NotFound(format!("feature {feature_name} in {environment}"))
            })?;
        merge_patch(&mut row.settings, patch);
        row.updated_at = now;
        Ok(())
    }

    async fn list_flags(
        &self,
        environment: &str,
    ) -> Result<Vec<FeatureFlagRow>, FeatureStoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<FeatureFlagRow> = inner
            .values()
            .filter(|row| row.environment == environment)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.feature_name.cmp(&b.feature_name));
        Ok(rows)
    }
}

struct PostgresFeatureStore {
    db: Arc<Db>,
}

#[async_trait]
impl FeatureStore for PostgresFeatureStore {
    async fn get_flag(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<Option<FeatureFlagRow>, FeatureStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT feature_name, environment, enabled, dependencies, settings, updated_at
                  FROM companion.feature_flags
                 WHERE feature_name = $1 AND environment = $2
                "#,
                &[&feature_name, &environment],
            )
            .await
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_flag_row)
            .transpose()
            .map_err(FeatureStoreError::Db)
    }

    async fn upsert_flag(&self, row: FeatureFlagRow) -> Result<(), FeatureStoreError> {
        let dependencies = serde_json::to_value(&row.dependencies)
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO companion.feature_flags (
                    feature_name, environment, enabled, dependencies, settings, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6)
                ON CONFLICT (feature_name, environment) DO UPDATE SET
                    enabled = EXCLUDED.enabled,
                    dependencies = EXCLUDED.dependencies,
                    settings = EXCLUDED.settings,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &row.feature_name,
                    &row.environment,
                    &row.enabled,
                    &dependencies,
                    &row.settings,
                    &row.updated_at,
                ],
            )
            .await
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn set_enabled(
        &self,
        feature_name: &str,
        environment: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE companion.feature_flags
                   SET enabled = $3, updated_at = $4
                 WHERE feature_name = $1 AND environment = $2
                "#,
                &[&feature_name, &environment, &enabled, &now],
            )
            .await
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(FeatureStoreError::NotFound(format!(
                "feature {feature_name} in {environment}"
            )));
        }
        Ok(())
    }

    async fn merge_settings(
        &self,
        feature_name: &str,
        environment: &str,
        patch: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), FeatureStoreError> {
        // jsonb `||` is a shallow top-level merge, matching the in-memory
        // implementation; strip_nulls drops keys patched to null.
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE companion.feature_flags
                   SET settings = jsonb_strip_nulls(settings || $3::jsonb),
                       updated_at = $4
                 WHERE feature_name = $1 AND environment = $2
                "#,
                &[&feature_name, &environment, &patch, &now],
            )
            .await
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(FeatureStoreError::NotFound(format!(
                "feature {feature_name} in {environment}"
            )));
        }
        Ok(())
    }

    async fn list_flags(
        &self,
        environment: &str,
    ) -> Result<Vec<FeatureFlagRow>, FeatureStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT feature_name, environment, enabled, dependencies, settings, updated_at
                  FROM companion.feature_flags
                 WHERE environment = $1
                 ORDER BY feature_name
                "#,
                &[&environment],
            )
            .await
            .map_err(|error| FeatureStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_flag_row(row).map_err(FeatureStoreError::Db))
            .collect()
    }
}

fn map_flag_row(row: &tokio_postgres::Row) -> Result<FeatureFlagRow, String> {
    let dependencies_value: Value = row.try_get("dependencies").map_err(|e| e.to_string())?;
    let dependencies: Vec<String> =
        serde_json::from_value(dependencies_value).map_err(|e| e.to_string())?;
    Ok(FeatureFlagRow {
        feature_name: row.try_get("feature_name").map_err(|e| e.to_string())?,
        environment: row.try_get("environment").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        dependencies,
        settings: row.try_get("settings").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}
