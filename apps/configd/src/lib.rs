#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::ab::AbTestHelper;
use crate::audit::store::AuditStore;
use crate::config::Config;
use crate::config_store::resolver::ConfigResolver;
use crate::config_store::service::ConfigAdmin;
use crate::config_store::store::ConfigStore;
use crate::db::Db;
use crate::features::registry::FeatureRegistry;
use crate::features::store::FeatureStore;
use crate::migration::admin::{MemorySchemaAdmin, SchemaAdmin};
use crate::migration::coordinator::{CoordinatorConfig, MigrationCoordinator};
use crate::migration::lock::MigrationLock;
use crate::migration::schema::Ident;
use crate::server::{AppState, build_router};

pub mod ab;
pub mod audit;
pub mod config;
pub mod config_store;
pub mod db;
pub mod features;
pub mod migration;
pub mod server;

/// Wire stores and services to the configured backend: Postgres when a
/// database URL is present, in-memory otherwise.
pub async fn build_state(config: Config) -> Result<AppState> {
    let schema = Ident::new(&config.schema_name)
        .with_context(|| format!("schema name {:?}", config.schema_name))?;

    let db = match &config.db_url {
        Some(url) => {
            let db = Arc::new(Db::connect(url).await?);
            db.ensure_base_schema().await?;
            Some(db)
        }
        None => None,
    };

    let (configs, flags, audit, lock, admin): (
        Arc<dyn ConfigStore>,
        Arc<dyn FeatureStore>,
        Arc<dyn AuditStore>,
        Arc<dyn MigrationLock>,
        Arc<dyn SchemaAdmin>,
    ) = match &db {
        Some(db) => (
            config_store::store::postgres(db.clone()),
            features::store::postgres(db.clone()),
            audit::store::postgres(db.clone()),
            migration::lock::postgres(db.clone()),
            migration::admin::postgres(db.clone()),
        ),
        None => {
            info!("no database configured, serving from in-memory stores");
            (
                config_store::store::memory(),
                features::store::memory(),
                audit::store::memory(),
                migration::lock::memory(),
                MemorySchemaAdmin::shared(),
            )
        }
    };

    let fallback = match &config.fallback_dir {
        Some(dir) => ConfigResolver::load_fallback_dir(dir),
        None => Default::default(),
    };
    let resolver = Arc::new(ConfigResolver::new(
        configs.clone(),
        fallback,
        config.env_override_prefix.as_str(),
    ));
    let registry = FeatureRegistry::new(flags.clone(), audit.clone(), config.dependency_policy);
    let coordinator = MigrationCoordinator::new(
        flags,
        resolver.clone(),
        admin,
        audit.clone(),
        lock,
        CoordinatorConfig {
            schema,
            dependency_policy: config.dependency_policy,
            rollback_recency_hours: config.rollback_recency_hours,
        },
    );
    let config_admin = ConfigAdmin::new(configs.clone(), audit.clone());
    let ab = AbTestHelper::new(configs, audit.clone(), &config.environment);

    Ok(AppState::new(
        config,
        resolver,
        registry,
        config_admin,
        coordinator,
        ab,
        audit,
    ))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        environment = %config.environment,
        "configd listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
