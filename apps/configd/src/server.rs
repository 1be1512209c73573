use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::ab::service::{AbTestError, AbTestHelper};
use crate::ab::types::OverrideGroupRequest;
use crate::audit::store::{AuditStore, AuditStoreError};
use crate::config::Config;
use crate::config_store::resolver::ConfigResolver;
use crate::config_store::service::{ConfigAdmin, ConfigAdminError};
use crate::features::registry::{FeatureRegistry, FeatureRegistryError};
use crate::migration::coordinator::{
    MigrationCoordinator, MigrationError, StatusProbeError,
};

/// Admin surface for operator tooling. Domain outcomes travel inside the
/// returned MigrationRecord JSON; HTTP error statuses are reserved for
/// malformed requests and infrastructure faults.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    resolver: Arc<ConfigResolver>,
    registry: FeatureRegistry,
    config_admin: ConfigAdmin,
    coordinator: MigrationCoordinator,
    ab: AbTestHelper,
    audit: Arc<dyn AuditStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        resolver: Arc<ConfigResolver>,
        registry: FeatureRegistry,
        config_admin: ConfigAdmin,
        coordinator: MigrationCoordinator,
        ab: AbTestHelper,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            resolver,
            registry,
            config_admin,
            coordinator,
            ab,
            audit,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/config/:key/resolved", get(get_resolved))
        .route("/v1/config/:key/versions", post(publish_version))
        .route("/v1/config/:key/activate", post(activate_version))
        .route("/v1/config/:key/overrides", post(set_override))
        .route("/v1/features/:name", get(get_feature))
        .route("/v1/features/:name/enabled", post(set_feature_enabled))
        .route("/v1/migrations/:feature/run", post(run_migration))
        .route("/v1/migrations/:feature/rollback", post(rollback_migration))
        .route("/v1/migrations/:feature/status", get(migration_status))
        .route("/v1/migrations/:feature/records", get(migration_records))
        .route("/v1/ab/groups", post(create_override_group).get(list_override_groups))
        .route("/v1/ab/sweep", post(sweep_expired))
        .with_state(state)
}

enum ApiError {
    InvalidRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            Self::InvalidRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };
        (
            status,
            Json(json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}

impl From<ConfigAdminError> for ApiError {
    fn from(error: ConfigAdminError) -> Self {
        match &error {
            ConfigAdminError::InvalidRequest(message) => Self::InvalidRequest(message.clone()),
            ConfigAdminError::Conflict(message) => Self::Conflict(message.clone()),
            ConfigAdminError::NotFound(message) => Self::NotFound(message.clone()),
            ConfigAdminError::Store(_) | ConfigAdminError::Audit(_) => {
                Self::Internal(error.to_string())
            }
        }
    }
}

impl From<FeatureRegistryError> for ApiError {
    fn from(error: FeatureRegistryError) -> Self {
        match &error {
            FeatureRegistryError::NotFound(message) => Self::NotFound(message.clone()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<AbTestError> for ApiError {
    fn from(error: AbTestError) -> Self {
        match &error {
            AbTestError::InvalidRequest(message) => Self::InvalidRequest(message.clone()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<MigrationError> for ApiError {
    fn from(error: MigrationError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<StatusProbeError> for ApiError {
    fn from(error: StatusProbeError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<AuditStoreError> for ApiError {
    fn from(error: AuditStoreError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<crate::config_store::store::ConfigStoreError> for ApiError {
    fn from(error: crate::config_store::store::ConfigStoreError) -> Self {
        Self::Internal(error.to_string())
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": state.config.service_name,
        "environment": state.config.environment,
    }))
}

#[derive(Deserialize)]
struct ResolvedQuery {
    user_id: Option<String>,
}

async fn get_resolved(
    State(state): State<AppState>,
    Path(config_key): Path<String>,
    Query(query): Query<ResolvedQuery>,
) -> Result<Json<Value>, ApiError> {
    let document = state
        .resolver
        .resolve(
            &config_key,
            query.user_id.as_deref(),
            &state.config.environment,
        )
        .await?;
    Ok(Json(document))
}

#[derive(Deserialize)]
struct PublishVersionRequest {
    version: String,
    payload: Value,
    created_by: String,
    description: Option<String>,
}

async fn publish_version(
    State(state): State<AppState>,
    Path(config_key): Path<String>,
    Json(request): Json<PublishVersionRequest>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .config_admin
        .publish_version(
            &config_key,
            &request.version,
            &state.config.environment,
            request.payload,
            &request.created_by,
            request.description,
        )
        .await?;
    Ok(Json(json!({
        "config_key": row.config_key,
        "version": row.version,
        "environment": row.environment,
        "active": row.active,
    })))
}

#[derive(Deserialize)]
struct ActivateVersionRequest {
    version: String,
}

async fn activate_version(
    State(state): State<AppState>,
    Path(config_key): Path<String>,
    Json(request): Json<ActivateVersionRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .config_admin
        .activate_version(&config_key, &request.version, &state.config.environment)
        .await?;
    Ok(Json(json!({
        "config_key": config_key,
        "version": request.version,
        "active": true,
    })))
}

#[derive(Deserialize)]
struct SetOverrideRequest {
    user_id: String,
    value: Value,
    priority: Option<i32>,
    ttl_hours: Option<i64>,
}

async fn set_override(
    State(state): State<AppState>,
    Path(config_key): Path<String>,
    Json(request): Json<SetOverrideRequest>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .config_admin
        .set_user_override(
            &state.config.environment,
            &request.user_id,
            &config_key,
            request.value,
            request.priority,
            request.ttl_hours,
            None,
        )
        .await?;
    Ok(Json(json!({
        "user_id": row.user_id,
        "config_key": row.config_key,
        "priority": row.priority,
        "expires_at": row.expires_at,
    })))
}

async fn get_feature(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let available = state
        .registry
        .is_available(&feature_name, &state.config.environment)
        .await?;
    let flag = state
        .registry
        .get_flag(&feature_name, &state.config.environment)
        .await?;
    Ok(Json(json!({
        "feature": feature_name,
        "environment": state.config.environment,
        "available": available,
        "flag": flag.map(|flag| json!({
            "enabled": flag.enabled,
            "dependencies": flag.dependencies,
            "settings": flag.settings,
            "updated_at": flag.updated_at,
        })),
    })))
}

#[derive(Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

async fn set_feature_enabled(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
    Json(request): Json<SetEnabledRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .set_enabled(&feature_name, &state.config.environment, request.enabled)
        .await?;
    Ok(Json(json!({
        "feature": feature_name,
        "enabled": request.enabled,
    })))
}

#[derive(Deserialize, Default)]
struct RunMigrationRequest {
    #[serde(default)]
    dry_run: bool,
}

async fn run_migration(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
    Json(request): Json<RunMigrationRequest>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .coordinator
        .run_migration(&feature_name, &state.config.environment, request.dry_run)
        .await?;
    Ok(Json(record.to_json()))
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    dry_run: bool,
}

async fn rollback_migration(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .coordinator
        .rollback(
            &feature_name,
            &state.config.environment,
            request.force,
            request.dry_run,
        )
        .await?;
    Ok(Json(record.to_json()))
}

async fn migration_status(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .coordinator
        .status(&feature_name, &state.config.environment)
        .await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct RecordsQuery {
    limit: Option<i64>,
}

async fn migration_records(
    State(state): State<AppState>,
    Path(feature_name): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .audit
        .list_records(
            &feature_name,
            &state.config.environment,
            query.limit.unwrap_or(20).clamp(1, 200),
        )
        .await?;
    let records: Vec<Value> = records.iter().map(|record| record.to_json()).collect();
    Ok(Json(json!({ "records": records })))
}

async fn create_override_group(
    State(state): State<AppState>,
    Json(request): Json<OverrideGroupRequest>,
) -> Result<Json<Value>, ApiError> {
    let enrolled = state.ab.create_override_group(request).await?;
    Ok(Json(json!({ "enrolled": enrolled })))
}

async fn list_override_groups(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let groups = state.ab.list_groups().await?;
    Ok(Json(
        serde_json::to_value(&groups).unwrap_or(Value::Array(Vec::new())),
    ))
}

async fn sweep_expired(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let removed = state.ab.sweep_expired().await?;
    Ok(Json(json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use anyhow::{Context, Result};
    use axum::extract::{Path, Query, State};
    use serde_json::json;

    use super::{ResolvedQuery, RunMigrationRequest, get_resolved, healthz, run_migration};
    use crate::build_state;
    use crate::config::Config;
    use crate::features::types::DependencyPolicy;

    fn memory_config() -> Result<Config> {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse()?;
        Ok(Config {
            service_name: "configd-test".to_string(),
            bind_addr,
            environment: "test".to_string(),
            db_url: None,
            schema_name: "companion".to_string(),
            fallback_dir: None,
            env_override_prefix: "COMPANION_SRV_TEST".to_string(),
            dependency_policy: DependencyPolicy::Advisory,
            rollback_recency_hours: 24,
        })
    }

    #[tokio::test]
    async fn healthz_reports_service_and_environment() -> Result<()> {
        let state = build_state(memory_config()?).await?;
        let response = healthz(State(state)).await;
        assert_eq!(response.0.get("status"), Some(&json!("ok")));
        assert_eq!(response.0.get("environment"), Some(&json!("test")));
        Ok(())
    }

    #[tokio::test]
    async fn resolved_endpoint_returns_empty_document_for_unknown_key() -> Result<()> {
        let state = build_state(memory_config()?).await?;
        let response = get_resolved(
            State(state),
            Path("nonexistent".to_string()),
            Query(ResolvedQuery { user_id: None }),
        )
        .await
        .ok()
        .context("resolve should not fail for missing keys")?;
        assert_eq!(response.0, json!({}));
        Ok(())
    }

    #[tokio::test]
    async fn migration_endpoint_reports_domain_outcomes_in_the_record() -> Result<()> {
        let state = build_state(memory_config()?).await?;
        let response = run_migration(
            State(state),
            Path("search_v2".to_string()),
            axum::Json(RunMigrationRequest { dry_run: false }),
        )
        .await
        .ok()
        .context("missing flag is a domain outcome, not an HTTP error")?;
        assert_eq!(response.0.get("status"), Some(&json!("skipped/flag_missing")));
        Ok(())
    }
}
