use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::audit::types::{ConfigChangeEvent, ConfigEventKind};
use crate::db::Db;
use crate::migration::types::{MigrationRecord, MigrationStatus, StepEvent};

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("db error: {0}")]
    Db(String),
}

/// Append-only sink for migration attempts and configuration changes.
/// Rows are immutable once appended; list operations are newest-first.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_record(&self, record: &MigrationRecord) -> Result<(), AuditStoreError>;

    async fn list_records(
        &self,
        migration_name: &str,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<MigrationRecord>, AuditStoreError>;

    async fn append_config_event(&self, event: &ConfigChangeEvent)
        -> Result<(), AuditStoreError>;

    async fn list_config_events(
        &self,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<ConfigChangeEvent>, AuditStoreError>;
}

pub fn memory() -> Arc<dyn AuditStore> {
    Arc::new(MemoryAuditStore::default())
}

pub fn postgres(db: Arc<Db>) -> Arc<dyn AuditStore> {
    Arc::new(PostgresAuditStore { db })
}

#[derive(Default)]
struct MemoryAuditStore {
    inner: Mutex<MemoryAuditStoreInner>,
}

#[derive(Default)]
struct MemoryAuditStoreInner {
    records: Vec<MigrationRecord>,
    events: Vec<ConfigChangeEvent>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append_record(&self, record: &MigrationRecord) -> Result<(), AuditStoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.push(record.clone());
        Ok(())
    }

    async fn list_records(
        &self,
        migration_name: &str,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<MigrationRecord>, AuditStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|record| {
                record.migration_name == migration_name && record.environment == environment
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn append_config_event(
        &self,
        event: &ConfigChangeEvent,
    ) -> Result<(), AuditStoreError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn list_config_events(
        &self,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<ConfigChangeEvent>, AuditStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|event| event.environment == environment)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

struct PostgresAuditStore {
    db: Arc<Db>,
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn append_record(&self, record: &MigrationRecord) -> Result<(), AuditStoreError> {
        let steps = serde_json::to_value(&record.steps)
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO companion.migration_log (
                    record_id, migration_name, environment, started_at, completed_at,
                    status, dry_run, steps, resolved_config
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
                "#,
                &[
                    &record.record_id,
                    &record.migration_name,
                    &record.environment,
                    &record.started_at,
                    &record.completed_at,
                    &record.status.code(),
                    &record.dry_run,
                    &steps,
                    &record.resolved_config,
                ],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn list_records(
        &self,
        migration_name: &str,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<MigrationRecord>, AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT record_id, migration_name, environment, started_at, completed_at,
                       status, dry_run, steps, resolved_config
                  FROM companion.migration_log
                 WHERE migration_name = $1 AND environment = $2
                 ORDER BY started_at DESC
                 LIMIT $3
                "#,
                &[&migration_name, &environment, &limit],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        rows.iter().map(map_record_row).collect()
    }

    async fn append_config_event(
        &self,
        event: &ConfigChangeEvent,
    ) -> Result<(), AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO companion.config_events (
                    event_id, environment, kind, subject, detail, created_at
                ) VALUES ($1,$2,$3,$4,$5,$6)
                "#,
                &[
                    &event.event_id,
                    &event.environment,
                    &event.kind.as_str(),
                    &event.subject,
                    &event.detail,
                    &event.created_at,
                ],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn list_config_events(
        &self,
        environment: &str,
        limit: i64,
    ) -> Result<Vec<ConfigChangeEvent>, AuditStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT event_id, environment, kind, subject, detail, created_at
                  FROM companion.config_events
                 WHERE environment = $1
                 ORDER BY created_at DESC
                 LIMIT $2
                "#,
                &[&environment, &limit],
            )
            .await
            .map_err(|error| AuditStoreError::Db(error.to_string()))?;
        rows.iter().map(map_event_row).collect()
    }
}

fn map_record_row(row: &tokio_postgres::Row) -> Result<MigrationRecord, AuditStoreError> {
    let status_code: String = row
        .try_get("status")
        .map_err(|error| AuditStoreError::Db(error.to_string()))?;
    let status = MigrationStatus::from_code(&status_code)
        .ok_or_else(|| AuditStoreError::Db(format!("unknown migration status: {status_code}")))?;
    let steps_value: serde_json::Value = row
        .try_get("steps")
        .map_err(|error| AuditStoreError::Db(error.to_string()))?;
    let steps: Vec<StepEvent> = serde_json::from_value(steps_value)
        .map_err(|error| AuditStoreError::Db(error.to_string()))?;
    Ok(MigrationRecord {
        record_id: row
            .try_get("record_id")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        migration_name: row
            .try_get("migration_name")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        environment: row
            .try_get("environment")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        started_at: row
            .try_get("started_at")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        status,
        dry_run: row
            .try_get("dry_run")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        steps,
        resolved_config: row
            .try_get("resolved_config")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
    })
}

fn map_event_row(row: &tokio_postgres::Row) -> Result<ConfigChangeEvent, AuditStoreError> {
    let kind_code: String = row
        .try_get("kind")
        .map_err(|error| AuditStoreError::Db(error.to_string()))?;
    let kind = ConfigEventKind::from_str_code(&kind_code)
        .ok_or_else(|| AuditStoreError::Db(format!("unknown config event kind: {kind_code}")))?;
    Ok(ConfigChangeEvent {
        event_id: row
            .try_get("event_id")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        environment: row
            .try_get("environment")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        kind,
        subject: row
            .try_get("subject")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        detail: row
            .try_get("detail")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|error| AuditStoreError::Db(error.to_string()))?,
    })
}
