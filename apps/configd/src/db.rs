use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Base DDL for the engine's own tables. Capability-specific objects
/// (search tables, indexes, routines) are provisioned later by the
/// migration coordinator, never here.
///
/// The partial unique index on (config_key, environment) WHERE active is
/// the storage-level guarantee behind the single-active-version invariant.
const BASE_SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS companion;

CREATE TABLE IF NOT EXISTS companion.config_versions (
    config_key   TEXT NOT NULL,
    version      TEXT NOT NULL,
    environment  TEXT NOT NULL,
    payload      JSONB NOT NULL,
    active       BOOLEAN NOT NULL DEFAULT FALSE,
    created_at   TIMESTAMPTZ NOT NULL,
    created_by   TEXT NOT NULL,
    description  TEXT,
    PRIMARY KEY (config_key, version, environment)
);

CREATE UNIQUE INDEX IF NOT EXISTS config_versions_single_active
    ON companion.config_versions (config_key, environment)
    WHERE active;

CREATE TABLE IF NOT EXISTS companion.feature_flags (
    feature_name TEXT NOT NULL,
    environment  TEXT NOT NULL,
    enabled      BOOLEAN NOT NULL DEFAULT FALSE,
    dependencies JSONB NOT NULL DEFAULT '[]'::jsonb,
    settings     JSONB NOT NULL DEFAULT '{}'::jsonb,
    updated_at   TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (feature_name, environment)
);

CREATE TABLE IF NOT EXISTS companion.user_config_overrides (
    user_id     TEXT NOT NULL,
    config_key  TEXT NOT NULL,
    value       JSONB NOT NULL,
    priority    INT NOT NULL DEFAULT 100,
    expires_at  TIMESTAMPTZ,
    tag         TEXT,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, config_key)
);

CREATE INDEX IF NOT EXISTS user_config_overrides_tagged
    ON companion.user_config_overrides (tag)
    WHERE tag IS NOT NULL;

CREATE TABLE IF NOT EXISTS companion.migration_log (
    record_id       TEXT PRIMARY KEY,
    migration_name  TEXT NOT NULL,
    environment     TEXT NOT NULL,
    started_at      TIMESTAMPTZ NOT NULL,
    completed_at    TIMESTAMPTZ,
    status          TEXT NOT NULL,
    dry_run         BOOLEAN NOT NULL,
    steps           JSONB NOT NULL,
    resolved_config JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS migration_log_by_name
    ON companion.migration_log (migration_name, environment, started_at DESC);

CREATE TABLE IF NOT EXISTS companion.config_events (
    event_id    TEXT PRIMARY KEY,
    environment TEXT NOT NULL,
    kind        TEXT NOT NULL,
    subject     TEXT NOT NULL,
    detail      JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS config_events_by_env
    ON companion.config_events (environment, created_at DESC);
"#;

#[derive(Clone)]
pub struct Db {
    client: Arc<Mutex<Client>>,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "configd postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Create the engine's own tables if they do not exist yet. Safe to run
    /// from every service instance at startup; all statements are
    /// create-if-absent.
    pub async fn ensure_base_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(BASE_SCHEMA_SQL)
            .await
            .context("ensure base schema")?;
        Ok(())
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
