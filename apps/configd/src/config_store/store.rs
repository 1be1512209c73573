use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config_store::types::{ConfigVersionRow, UserOverrideRow};
use crate::db::Db;

#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Persistence seam for config versions and per-user overrides. Reads are
/// lock-free and never fail for missing data; `activate_version` is the one
/// operation with multi-row atomicity requirements.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Payload of the single active version for (key, environment), if any.
    async fn get_active_payload(
        &self,
        config_key: &str,
        environment: &str,
    ) -> Result<Option<Value>, ConfigStoreError>;

    async fn get_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<Option<ConfigVersionRow>, ConfigStoreError>;

    /// Insert-only; a duplicate (key, version, environment) is a conflict.
    async fn insert_version(&self, row: ConfigVersionRow) -> Result<(), ConfigStoreError>;

    /// Deactivate the current active row and activate the named version in
    /// one transaction. Concurrent activations race but always leave exactly
    /// one active row per (key, environment).
    async fn activate_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<(), ConfigStoreError>;

    /// The non-expired override with the lowest priority value for
    /// (user, key); ties break to the most recently updated row.
    async fn best_override(
        &self,
        user_id: &str,
        config_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserOverrideRow>, ConfigStoreError>;

    async fn upsert_override(&self, row: UserOverrideRow) -> Result<(), ConfigStoreError>;

    /// Every override carrying a tag, expired or not, for group aggregation.
    async fn list_tagged_overrides(&self) -> Result<Vec<UserOverrideRow>, ConfigStoreError>;

    /// Delete expired override rows; returns the count removed.
    async fn delete_expired_overrides(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, ConfigStoreError>;
}

pub fn memory() -> Arc<dyn ConfigStore> {
    Arc::new(MemoryConfigStore::default())
}

pub fn postgres(db: Arc<Db>) -> Arc<dyn ConfigStore> {
    Arc::new(PostgresConfigStore { db })
}

#[derive(Default)]
struct MemoryConfigStore {
    inner: Mutex<MemoryConfigStoreInner>,
}

#[derive(Default)]
struct MemoryConfigStoreInner {
    // key: (config_key, version, environment)
    versions: HashMap<(String, String, String), ConfigVersionRow>,
    // key: (user_id, config_key)
    overrides: HashMap<(String, String), UserOverrideRow>,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_active_payload(
        &self,
        config_key: &str,
        environment: &str,
    ) -> Result<Option<Value>, ConfigStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .versions
            .values()
            .find(|row| {
                row.active && row.config_key == config_key && row.environment == environment
            })
            .map(|row| row.payload.clone()))
    }

    async fn get_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<Option<ConfigVersionRow>, ConfigStoreError> {
        let inner = self.inner.lock().await;
        let key = (
            config_key.to_string(),
            version.to_string(),
            environment.to_string(),
        );
        Ok(inner.versions.get(&key).cloned())
    }

    async fn insert_version(&self, row: ConfigVersionRow) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        let key = (
            row.config_key.clone(),
            row.version.clone(),
            row.environment.clone(),
        );
        if inner.versions.contains_key(&key) {
            return Err(ConfigStoreError::Conflict(format!(
                "config version {}@{} already exists in {}",
                row.config_key, row.version, row.environment
            )));
        }
        inner.versions.insert(key, row);
        Ok(())
    }

    async fn activate_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<(), ConfigStoreError> {
        // Single mutex guard spans the deactivate + activate pair, which is
        // the in-memory equivalent of the Postgres transaction.
        let mut inner = self.inner.lock().await;
        let target = (
            config_key.to_string(),
            version.to_string(),
            environment.to_string(),
        );
        if !inner.versions.contains_key(&target) {
            return Err(ConfigStoreError::NotFound(format!(
                "config version {config_key}@{version} in {environment}"
            )));
        }
        for row in inner.versions.values_mut() {
            if row.config_key == config_key && row.environment == environment {
                row.active = row.version == version;
            }
        }
        Ok(())
    }

    async fn best_override(
        &self,
        user_id: &str,
        config_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserOverrideRow>, ConfigStoreError> {
        let inner = self.inner.lock().await;
        let key = (user_id.to_string(), config_key.to_string());
        Ok(inner
            .overrides
            .get(&key)
            .filter(|row| !row.is_expired(now))
            .cloned())
    }

    async fn upsert_override(&self, row: UserOverrideRow) -> Result<(), ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        let key = (row.user_id.clone(), row.config_key.clone());
        inner.overrides.insert(key, row);
        Ok(())
    }

    async fn list_tagged_overrides(&self) -> Result<Vec<UserOverrideRow>, ConfigStoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<UserOverrideRow> = inner
            .overrides
            .values()
            .filter(|row| row.tag.is_some())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(rows)
    }

    async fn delete_expired_overrides(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, ConfigStoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.overrides.len();
        inner.overrides.retain(|_, row| !row.is_expired(now));
        Ok((before - inner.overrides.len()) as u64)
    }
}

struct PostgresConfigStore {
    db: Arc<Db>,
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn get_active_payload(
        &self,
        config_key: &str,
        environment: &str,
    ) -> Result<Option<Value>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT payload
                  FROM companion.config_versions
                 WHERE config_key = $1 AND environment = $2 AND active
                "#,
                &[&config_key, &environment],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        row.map(|row| row.try_get("payload"))
            .transpose()
            .map_err(|error| ConfigStoreError::Db(error.to_string()))
    }

    async fn get_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<Option<ConfigVersionRow>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT config_key, version, environment, payload, active,
                       created_at, created_by, description
                  FROM companion.config_versions
                 WHERE config_key = $1 AND version = $2 AND environment = $3
                "#,
                &[&config_key, &version, &environment],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_version_row)
            .transpose()
            .map_err(ConfigStoreError::Db)
    }

    async fn insert_version(&self, row: ConfigVersionRow) -> Result<(), ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO companion.config_versions (
                    config_key, version, environment, payload, active,
                    created_at, created_by, description
                ) VALUES ($1,$2,$3,$4,FALSE,$5,$6,$7)
                ON CONFLICT (config_key, version, environment) DO NOTHING
                "#,
                &[
                    &row.config_key,
                    &row.version,
                    &row.environment,
                    &row.payload,
                    &row.created_at,
                    &row.created_by,
                    &row.description,
                ],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        if inserted == 0 {
            return Err(ConfigStoreError::Conflict(format!(
                "config version {}@{} already exists in {}",
                row.config_key, row.version, row.environment
            )));
        }
        Ok(())
    }

    async fn activate_version(
        &self,
        config_key: &str,
        version: &str,
        environment: &str,
    ) -> Result<(), ConfigStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            UPDATE companion.config_versions
               SET active = FALSE
             WHERE config_key = $1 AND environment = $2 AND active
            "#,
            &[&config_key, &environment],
        )
        .await
        .map_err(|error| ConfigStoreError::Db(error.to_string()))?;

        let activated = tx
            .execute(
                r#"
                UPDATE companion.config_versions
                   SET active = TRUE
                 WHERE config_key = $1 AND version = $2 AND environment = $3
                "#,
                &[&config_key, &version, &environment],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;

        if activated == 0 {
            // Implicit rollback when the transaction drops unfinished.
            return Err(ConfigStoreError::NotFound(format!(
                "config version {config_key}@{version} in {environment}"
            )));
        }

        tx.commit()
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn best_override(
        &self,
        user_id: &str,
        config_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserOverrideRow>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT user_id, config_key, value, priority, expires_at, tag, updated_at
                  FROM companion.user_config_overrides
                 WHERE user_id = $1 AND config_key = $2
                   AND (expires_at IS NULL OR expires_at > $3)
                 ORDER BY priority ASC, updated_at DESC
                 LIMIT 1
                "#,
                &[&user_id, &config_key, &now],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_override_row)
            .transpose()
            .map_err(ConfigStoreError::Db)
    }

    async fn upsert_override(&self, row: UserOverrideRow) -> Result<(), ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO companion.user_config_overrides (
                    user_id, config_key, value, priority, expires_at, tag, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7)
                ON CONFLICT (user_id, config_key) DO UPDATE SET
                    value = EXCLUDED.value,
                    priority = EXCLUDED.priority,
                    expires_at = EXCLUDED.expires_at,
                    tag = EXCLUDED.tag,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &row.user_id,
                    &row.config_key,
                    &row.value,
                    &row.priority,
                    &row.expires_at,
                    &row.tag,
                    &row.updated_at,
                ],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn list_tagged_overrides(&self) -> Result<Vec<UserOverrideRow>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT user_id, config_key, value, priority, expires_at, tag, updated_at
                  FROM companion.user_config_overrides
                 WHERE tag IS NOT NULL
                 ORDER BY updated_at ASC
                "#,
                &[],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| map_override_row(row).map_err(ConfigStoreError::Db))
            .collect()
    }

    async fn delete_expired_overrides(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                DELETE FROM companion.user_config_overrides
                 WHERE expires_at IS NOT NULL AND expires_at <= $1
                "#,
                &[&now],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))
    }
}

fn map_version_row(row: &tokio_postgres::Row) -> Result<ConfigVersionRow, String> {
    Ok(ConfigVersionRow {
        config_key: row.try_get("config_key").map_err(|e| e.to_string())?,
        version: row.try_get("version").map_err(|e| e.to_string())?,
        environment: row.try_get("environment").map_err(|e| e.to_string())?,
        payload: row.try_get("payload").map_err(|e| e.to_string())?,
        active: row.try_get("active").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        created_by: row.try_get("created_by").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
    })
}

fn map_override_row(row: &tokio_postgres::Row) -> Result<UserOverrideRow, String> {
    Ok(UserOverrideRow {
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        config_key: row.try_get("config_key").map_err(|e| e.to_string())?,
        value: row.try_get("value").map_err(|e| e.to_string())?,
        priority: row.try_get("priority").map_err(|e| e.to_string())?,
        expires_at: row.try_get("expires_at").map_err(|e| e.to_string())?,
        tag: row.try_get("tag").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}
