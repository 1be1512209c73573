use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value, json};

use crate::audit::store::{AuditStore, AuditStoreError};
use crate::config_store::resolver::{ConfigResolver, apply_layer};
use crate::config_store::store::ConfigStoreError;
use crate::features::store::{FeatureStore, FeatureStoreError};
use crate::features::types::{
    DependencyPolicy, FeatureFlagRow, SETTING_LAST_ERROR, SETTING_RESOLVED,
    SETTING_SHAPE_MISMATCHES, SETTING_STATUS,
};
use crate::migration::admin::{SchemaAdmin, SchemaAdminError};
use crate::migration::lock::{LockError, MigrationLock, lock_key};
use crate::migration::schema::{Ident, build_plan};
use crate::migration::types::{
    AbortReason, FailureKind, MigrationRecord, MigrationStatus, SkipReason, StepAction,
    StepEvent, StepOutcome,
};

/// Config key of the system-wide defaults document in the parameter chain.
pub const MIGRATION_DEFAULTS_CONFIG_KEY: &str = "migration_defaults";

/// Resolvable rollback safety window; overridable per feature through the
/// standard parameter chain.
pub const ROLLBACK_RECENCY_PARAM: &str = "rollback_recency_hours";
pub const DEFAULT_ROLLBACK_RECENCY_HOURS: i64 = 24;

/// Infrastructure faults are the only errors a coordinator call surfaces;
/// every domain outcome travels inside the returned MigrationRecord.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("audit error: {0}")]
    Audit(#[from] AuditStoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum StatusProbeError {
    #[error("feature store error: {0}")]
    Feature(#[from] FeatureStoreError),
    #[error("schema admin error: {0}")]
    Admin(#[from] SchemaAdminError),
    #[error("config store error: {0}")]
    Store(#[from] ConfigStoreError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub schema: Ident,
    pub dependency_policy: DependencyPolicy,
    pub rollback_recency_hours: i64,
}

/// Converges a feature's backing schema objects toward its resolved
/// configuration: exactly-once-effectively, mutually exclusive per
/// (feature, environment), never silently destructive.
#[derive(Clone)]
pub struct MigrationCoordinator {
    features: Arc<dyn FeatureStore>,
    resolver: Arc<ConfigResolver>,
    admin: Arc<dyn SchemaAdmin>,
    audit: Arc<dyn AuditStore>,
    lock: Arc<dyn MigrationLock>,
    config: CoordinatorConfig,
}

impl MigrationCoordinator {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        resolver: Arc<ConfigResolver>,
        admin: Arc<dyn SchemaAdmin>,
        audit: Arc<dyn AuditStore>,
        lock: Arc<dyn MigrationLock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            features,
            resolver,
            admin,
            audit,
            lock,
            config,
        }
    }

    pub async fn run_migration(
        &self,
        feature_name: &str,
        environment: &str,
        dry_run: bool,
    ) -> Result<MigrationRecord, MigrationError> {
        let key = lock_key(feature_name, environment);
        if !self.lock.try_acquire(key).await? {
            tracing::info!(
                feature = feature_name,
                environment,
                "migration skipped: lock contention"
            );
            let record = MigrationRecord::begin(feature_name, environment, dry_run)
                .finish(MigrationStatus::Skipped(SkipReason::LockContention));
            self.audit.append_record(&record).await?;
            return Ok(record);
        }

        let record = self.converge(feature_name, environment, dry_run).await;

        // Release before anything that could fail; the audit append must not
        // leave the lock held.
        let release = self.lock.release(key).await;
        self.audit.append_record(&record).await?;
        release?;
        tracing::info!(
            feature = feature_name,
            environment,
            status = %record.status.code(),
            dry_run,
            "migration finished"
        );
        Ok(record)
    }

    pub async fn rollback(
        &self,
        feature_name: &str,
        environment: &str,
        force: bool,
        dry_run: bool,
    ) -> Result<MigrationRecord, MigrationError> {
        let key = lock_key(feature_name, environment);
        if !self.lock.try_acquire(key).await? {
            let record = MigrationRecord::begin(feature_name, environment, dry_run)
                .finish(MigrationStatus::Skipped(SkipReason::LockContention));
            self.audit.append_record(&record).await?;
            return Ok(record);
        }

        let record = self
            .rollback_locked(feature_name, environment, force, dry_run)
            .await;

        let release = self.lock.release(key).await;
        self.audit.append_record(&record).await?;
        release?;
        tracing::info!(
            feature = feature_name,
            environment,
            status = %record.status.code(),
            force,
            dry_run,
            "rollback finished"
        );
        Ok(record)
    }

    /// Read-only merge of stored flag settings with a live catalog probe.
    pub async fn status(
        &self,
        feature_name: &str,
        environment: &str,
    ) -> Result<Value, StatusProbeError> {
        let Some(flag) = self.features.get_flag(feature_name, environment).await? else {
            return Ok(json!({
                "feature": feature_name,
                "environment": environment,
                "flag": Value::Null,
            }));
        };

        let mut doc = json!({
            "feature": feature_name,
            "environment": environment,
            "enabled": flag.enabled,
            "dependencies": flag.dependencies,
            "settings": flag.settings,
        });

        let params = match self.resolve_parameters(feature_name, environment, &flag).await {
            Ok(params) => params,
            Err(error) => return Err(StatusProbeError::Store(error)),
        };
        match build_plan(&self.config.schema, &params) {
            Ok(plan) => {
                let table_exists = self.admin.table_exists(&plan.table).await?;
                let row_count = if table_exists {
                    self.admin.row_count(&plan.table).await?
                } else {
                    0
                };
                let search_index_exists = self
                    .admin
                    .index_exists(&self.config.schema, plan.search_index.name())
                    .await?;
                let mut routines = Map::new();
                for routine in &plan.routines {
                    routines.insert(
                        routine.qualified(),
                        Value::Bool(self.admin.routine_exists(routine).await?),
                    );
                }
                if let Some(map) = doc.as_object_mut() {
                    map.insert("table".to_string(), json!(plan.table.qualified()));
                    map.insert("table_exists".to_string(), json!(table_exists));
                    map.insert("row_count".to_string(), json!(row_count));
                    map.insert(
                        "search_index_exists".to_string(),
                        json!(search_index_exists),
                    );
                    map.insert("routines".to_string(), Value::Object(routines));
                }
            }
            Err(error) => {
                if let Some(map) = doc.as_object_mut() {
                    map.insert("plan_error".to_string(), json!(error.to_string()));
                }
            }
        }
        Ok(doc)
    }

    /// Ascending-priority merge: system-wide defaults document, then the
    /// feature's own global document, then the flag's tunable settings.
    /// Built-in capability fallbacks sit below all of these, inside the plan
    /// builder.
    async fn resolve_parameters(
        &self,
        feature_name: &str,
        environment: &str,
        flag: &FeatureFlagRow,
    ) -> Result<Value, ConfigStoreError> {
        let mut merged = Map::new();
        let defaults = self
            .resolver
            .resolve(MIGRATION_DEFAULTS_CONFIG_KEY, None, environment)
            .await?;
        apply_layer(&mut merged, &defaults);
        let global = self.resolver.resolve(feature_name, None, environment).await?;
        apply_layer(&mut merged, &global);
        apply_layer(&mut merged, &flag.tunable_settings());
        Ok(Value::Object(merged))
    }

    async fn unsatisfied_dependencies(
        &self,
        flag: &FeatureFlagRow,
        environment: &str,
    ) -> Result<Vec<String>, FeatureStoreError> {
        let mut unsatisfied = Vec::new();
        for dependency in &flag.dependencies {
            let satisfied = self
                .features
                .get_flag(dependency, environment)
                .await?
                .is_some_and(|row| row.enabled);
            if !satisfied {
                unsatisfied.push(dependency.clone());
            }
        }
        Ok(unsatisfied)
    }

    async fn converge(
        &self,
        feature_name: &str,
        environment: &str,
        dry_run: bool,
    ) -> MigrationRecord {
        let mut record = MigrationRecord::begin(feature_name, environment, dry_run);

        let flag = match self.features.get_flag(feature_name, environment).await {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                return record.finish(MigrationStatus::Skipped(SkipReason::FlagMissing));
            }
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        };
        if !flag.enabled {
            return record.finish(MigrationStatus::Skipped(SkipReason::FeatureDisabled));
        }

        match self.unsatisfied_dependencies(&flag, environment).await {
            Ok(unsatisfied) if unsatisfied.is_empty() => {
                record.push(StepEvent::new(
                    "dependencies",
                    StepAction::DependencyCheck,
                    StepOutcome::Satisfied,
                ));
            }
            Ok(unsatisfied) => {
                let detail = unsatisfied.join(", ");
                record.push(
                    StepEvent::new(
                        "dependencies",
                        StepAction::DependencyCheck,
                        StepOutcome::Unsatisfied,
                    )
                    .with_detail(&detail),
                );
                match self.config.dependency_policy {
                    DependencyPolicy::Advisory => {
                        tracing::warn!(
                            feature = feature_name,
                            environment,
                            unsatisfied = %detail,
                            "dependencies unsatisfied (advisory), continuing"
                        );
                    }
                    DependencyPolicy::Enforce => {
                        return record
                            .finish(MigrationStatus::Skipped(SkipReason::DependencyUnsatisfied));
                    }
                }
            }
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }

        let params = match self.resolve_parameters(feature_name, environment, &flag).await {
            Ok(params) => params,
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        };
        record.resolved_config = json!({ "parameters": params.clone() });

        let plan = match build_plan(&self.config.schema, &params) {
            Ok(plan) => plan,
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::InvalidParameters, error.to_string())
                    .await;
            }
        };
        record.resolved_config = json!({ "parameters": params, "effective": plan.summary.clone() });

        // Extension preflight.
        let extension = plan.extension();
        let extension_target = format!("extension:{extension}");
        match self.admin.extension_available(extension).await {
            Ok(true) => {}
            Ok(false) => {
                record.push(
                    StepEvent::new(
                        &extension_target,
                        StepAction::EnsureExtension,
                        StepOutcome::Failed,
                    )
                    .with_detail("not available on this server"),
                );
                return self
                    .fail(
                        record,
                        feature_name,
                        environment,
                        FailureKind::CapabilityUnavailable,
                        format!("extension {extension} is not available"),
                    )
                    .await;
            }
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }
        match self.admin.extension_installed(extension).await {
            Ok(true) => {
                record.push(StepEvent::new(
                    &extension_target,
                    StepAction::EnsureExtension,
                    StepOutcome::AlreadySatisfied,
                ));
            }
            Ok(false) if dry_run => {
                record.push(StepEvent::new(
                    &extension_target,
                    StepAction::EnsureExtension,
                    StepOutcome::WouldCreate,
                ));
            }
            Ok(false) => match self.admin.install_extension(extension).await {
                Ok(()) => {
                    record.push(StepEvent::new(
                        &extension_target,
                        StepAction::EnsureExtension,
                        StepOutcome::Created,
                    ));
                }
                Err(error) => {
                    record.push(
                        StepEvent::new(
                            &extension_target,
                            StepAction::EnsureExtension,
                            StepOutcome::Failed,
                        )
                        .with_detail(error.to_string()),
                    );
                    return self
                        .fail(
                            record,
                            feature_name,
                            environment,
                            classify_ddl_error(&error.to_string()),
                            error.to_string(),
                        )
                        .await;
                }
            },
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }

        // Privilege preflight.
        let schema_target = format!("schema:{}", self.config.schema.as_str());
        match self.admin.has_create_privilege(&self.config.schema).await {
            Ok(true) => {
                record.push(StepEvent::new(
                    &schema_target,
                    StepAction::PrivilegeCheck,
                    StepOutcome::Satisfied,
                ));
            }
            Ok(false) => {
                record.push(StepEvent::new(
                    &schema_target,
                    StepAction::PrivilegeCheck,
                    StepOutcome::Failed,
                ));
                return self
                    .fail(
                        record,
                        feature_name,
                        environment,
                        FailureKind::PrivilegeDenied,
                        format!(
                            "current role lacks CREATE on schema {}",
                            self.config.schema.as_str()
                        ),
                    )
                    .await;
            }
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }

        // Backing table, with shape check on the already-existing path.
        let mut mismatches: Vec<String> = Vec::new();
        let table_target = format!("table:{}", plan.table.qualified());
        match self.admin.table_exists(&plan.table).await {
            Ok(true) => {
                if let (Some(expected), Some(column)) =
                    (plan.expected_vector_dim, plan.vector_column())
                {
                    match self.admin.vector_column_width(&plan.table, column).await {
                        Ok(Some(actual)) if actual == expected => {
                            record.push(StepEvent::new(
                                &table_target,
                                StepAction::ShapeCheck,
                                StepOutcome::Satisfied,
                            ));
                        }
                        Ok(Some(actual)) => {
                            let detail = format!(
                                "column {} is VECTOR({actual}), resolved configuration wants VECTOR({expected})",
                                column.as_str()
                            );
                            record.push(
                                StepEvent::new(
                                    &table_target,
                                    StepAction::ShapeCheck,
                                    StepOutcome::Mismatch,
                                )
                                .with_detail(&detail),
                            );
                            mismatches.push(detail);
                        }
                        Ok(None) => {
                            let detail = format!(
                                "column {} is missing or not a vector",
                                column.as_str()
                            );
                            record.push(
                                StepEvent::new(
                                    &table_target,
                                    StepAction::ShapeCheck,
                                    StepOutcome::Mismatch,
                                )
                                .with_detail(&detail),
                            );
                            mismatches.push(detail);
                        }
                        Err(error) => {
                            return self
                                .fail(
                                    record,
                                    feature_name,
                                    environment,
                                    FailureKind::UnexpectedError,
                                    error.to_string(),
                                )
                                .await;
                        }
                    }
                }
                record.push(StepEvent::new(
                    &table_target,
                    StepAction::EnsureTable,
                    StepOutcome::AlreadySatisfied,
                ));
            }
            Ok(false) if dry_run => {
                record.push(StepEvent::new(
                    &table_target,
                    StepAction::EnsureTable,
                    StepOutcome::WouldCreate,
                ));
            }
            Ok(false) => match self.admin.create_table(&plan.table).await {
                Ok(()) => {
                    record.push(StepEvent::new(
                        &table_target,
                        StepAction::EnsureTable,
                        StepOutcome::Created,
                    ));
                }
                Err(error) => {
                    record.push(
                        StepEvent::new(&table_target, StepAction::EnsureTable, StepOutcome::Failed)
                            .with_detail(error.to_string()),
                    );
                    return self
                        .fail(
                            record,
                            feature_name,
                            environment,
                            classify_ddl_error(&error.to_string()),
                            error.to_string(),
                        )
                        .await;
                }
            },
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }

        // Standard secondary indexes.
        for index in &plan.secondary_indexes {
            let target = format!("index:{}.{}", index.schema.as_str(), index.name.as_str());
            match self.admin.index_exists(&index.schema, &index.name).await {
                Ok(true) => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::EnsureIndex,
                        StepOutcome::AlreadySatisfied,
                    ));
                }
                Ok(false) if dry_run => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::EnsureIndex,
                        StepOutcome::WouldCreate,
                    ));
                }
                Ok(false) => match self.admin.create_index(index).await {
                    Ok(()) => {
                        record.push(StepEvent::new(
                            &target,
                            StepAction::EnsureIndex,
                            StepOutcome::Created,
                        ));
                    }
                    Err(error) => {
                        record.push(
                            StepEvent::new(&target, StepAction::EnsureIndex, StepOutcome::Failed)
                                .with_detail(error.to_string()),
                        );
                        return self
                            .fail(
                                record,
                                feature_name,
                                environment,
                                classify_ddl_error(&error.to_string()),
                                error.to_string(),
                            )
                            .await;
                    }
                },
                Err(error) => {
                    return self
                        .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                        .await;
                }
            }
        }

        // Capability-specific search index.
        let search_target = format!(
            "index:{}.{}",
            self.config.schema.as_str(),
            plan.search_index.name().as_str()
        );
        match self
            .admin
            .index_exists(&self.config.schema, plan.search_index.name())
            .await
        {
            Ok(true) => {
                record.push(StepEvent::new(
                    &search_target,
                    StepAction::EnsureIndex,
                    StepOutcome::AlreadySatisfied,
                ));
            }
            Ok(false) if dry_run => {
                record.push(StepEvent::new(
                    &search_target,
                    StepAction::EnsureIndex,
                    StepOutcome::WouldCreate,
                ));
            }
            Ok(false) => match self.admin.create_search_index(&plan.search_index).await {
                Ok(()) => {
                    record.push(StepEvent::new(
                        &search_target,
                        StepAction::EnsureIndex,
                        StepOutcome::Created,
                    ));
                }
                Err(error) => {
                    record.push(
                        StepEvent::new(&search_target, StepAction::EnsureIndex, StepOutcome::Failed)
                            .with_detail(error.to_string()),
                    );
                    return self
                        .fail(
                            record,
                            feature_name,
                            environment,
                            classify_ddl_error(&error.to_string()),
                            error.to_string(),
                        )
                        .await;
                }
            },
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        }

        // Capability-specific routines.
        for routine in &plan.routines {
            let target = format!("routine:{}", routine.qualified());
            match self.admin.routine_exists(routine).await {
                Ok(true) => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::EnsureRoutine,
                        StepOutcome::AlreadySatisfied,
                    ));
                }
                Ok(false) if dry_run => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::EnsureRoutine,
                        StepOutcome::WouldCreate,
                    ));
                }
                Ok(false) => match self.admin.create_routine(routine).await {
                    Ok(()) => {
                        record.push(StepEvent::new(
                            &target,
                            StepAction::EnsureRoutine,
                            StepOutcome::Created,
                        ));
                    }
                    Err(error) => {
                        record.push(
                            StepEvent::new(&target, StepAction::EnsureRoutine, StepOutcome::Failed)
                                .with_detail(error.to_string()),
                        );
                        return self
                            .fail(
                                record,
                                feature_name,
                                environment,
                                classify_ddl_error(&error.to_string()),
                                error.to_string(),
                            )
                            .await;
                    }
                },
                Err(error) => {
                    return self
                        .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                        .await;
                }
            }
        }

        let status = if dry_run {
            MigrationStatus::DryRunCompleted
        } else {
            MigrationStatus::Installed
        };

        let mut patch = Map::new();
        patch.insert(SETTING_STATUS.to_string(), json!(status.code()));
        patch.insert(SETTING_RESOLVED.to_string(), plan.summary.clone());
        patch.insert(SETTING_LAST_ERROR.to_string(), Value::Null);
        patch.insert(
            SETTING_SHAPE_MISMATCHES.to_string(),
            if mismatches.is_empty() {
                Value::Null
            } else {
                json!(mismatches)
            },
        );
        if let Err(error) = self
            .features
            .merge_settings(feature_name, environment, &Value::Object(patch), Utc::now())
            .await
        {
            return self
                .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                .await;
        }

        record.finish(status)
    }

    async fn rollback_locked(
        &self,
        feature_name: &str,
        environment: &str,
        force: bool,
        dry_run: bool,
    ) -> MigrationRecord {
        let mut record = MigrationRecord::begin(feature_name, environment, dry_run);

        let flag = match self.features.get_flag(feature_name, environment).await {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                return record.finish(MigrationStatus::Skipped(SkipReason::FlagMissing));
            }
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        };

        let params = match self.resolve_parameters(feature_name, environment, &flag).await {
            Ok(params) => params,
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        };
        let plan = match build_plan(&self.config.schema, &params) {
            Ok(plan) => plan,
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::InvalidParameters, error.to_string())
                    .await;
            }
        };
        record.resolved_config = json!({ "parameters": params.clone(), "effective": plan.summary.clone() });

        let table_target = format!("table:{}", plan.table.qualified());
        let table_exists = match self.admin.table_exists(&plan.table).await {
            Ok(exists) => exists,
            Err(error) => {
                return self
                    .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                    .await;
            }
        };

        // Recency guard: refuse to drop a table whose newest row is inside
        // the resolvable safety window, unless forced.
        if table_exists {
            let window_hours = recency_window_hours(&params, self.config.rollback_recency_hours);
            let created_at = plan.table.column("created_at").map(|column| column.name.clone());
            if force {
                record.push(
                    StepEvent::new(&table_target, StepAction::RecencyCheck, StepOutcome::Satisfied)
                        .with_detail("forced"),
                );
            } else if let Some(created_at) = created_at {
                match self.admin.newest_row_at(&plan.table, &created_at).await {
                    Ok(Some(newest))
                        if newest > Utc::now() - Duration::hours(window_hours) =>
                    {
                        record.push(
                            StepEvent::new(
                                &table_target,
                                StepAction::RecencyCheck,
                                StepOutcome::Unsatisfied,
                            )
                            .with_detail(format!(
                                "newest row at {newest} is inside the {window_hours}h window"
                            )),
                        );
                        return record.finish(MigrationStatus::Aborted(AbortReason::HasRecentData));
                    }
                    Ok(_) => {
                        record.push(StepEvent::new(
                            &table_target,
                            StepAction::RecencyCheck,
                            StepOutcome::Satisfied,
                        ));
                    }
                    Err(error) => {
                        return self
                            .fail(
                                record,
                                feature_name,
                                environment,
                                FailureKind::UnexpectedError,
                                error.to_string(),
                            )
                            .await;
                    }
                }
            }
        }

        // Routines first, then the table they reference.
        for routine in &plan.routines {
            let target = format!("routine:{}", routine.qualified());
            match self.admin.routine_exists(routine).await {
                Ok(false) => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::DropRoutine,
                        StepOutcome::AlreadyAbsent,
                    ));
                }
                Ok(true) if dry_run => {
                    record.push(StepEvent::new(
                        &target,
                        StepAction::DropRoutine,
                        StepOutcome::WouldDrop,
                    ));
                }
                Ok(true) => match self.admin.drop_routine(routine).await {
                    Ok(()) => {
                        record.push(StepEvent::new(
                            &target,
                            StepAction::DropRoutine,
                            StepOutcome::Dropped,
                        ));
                    }
                    Err(error) => {
                        record.push(
                            StepEvent::new(&target, StepAction::DropRoutine, StepOutcome::Failed)
                                .with_detail(error.to_string()),
                        );
                        return self
                            .fail(
                                record,
                                feature_name,
                                environment,
                                classify_ddl_error(&error.to_string()),
                                error.to_string(),
                            )
                            .await;
                    }
                },
                Err(error) => {
                    return self
                        .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                        .await;
                }
            }
        }

        if !table_exists {
            record.push(StepEvent::new(
                &table_target,
                StepAction::DropTable,
                StepOutcome::AlreadyAbsent,
            ));
        } else if dry_run {
            record.push(StepEvent::new(
                &table_target,
                StepAction::DropTable,
                StepOutcome::WouldDrop,
            ));
        } else {
            match self.admin.drop_table(&plan.table).await {
                Ok(()) => {
                    record.push(StepEvent::new(
                        &table_target,
                        StepAction::DropTable,
                        StepOutcome::Dropped,
                    ));
                }
                Err(error) => {
                    record.push(
                        StepEvent::new(&table_target, StepAction::DropTable, StepOutcome::Failed)
                            .with_detail(error.to_string()),
                    );
                    return self
                        .fail(
                            record,
                            feature_name,
                            environment,
                            classify_ddl_error(&error.to_string()),
                            error.to_string(),
                        )
                        .await;
                }
            }
        }

        if dry_run {
            return record.finish(MigrationStatus::DryRunCompleted);
        }

        let patch = json!({
            SETTING_STATUS: MigrationStatus::RolledBack.code(),
            SETTING_LAST_ERROR: Value::Null,
        });
        if let Err(error) = self
            .features
            .merge_settings(feature_name, environment, &patch, Utc::now())
            .await
        {
            return self
                .fail(record, feature_name, environment, FailureKind::UnexpectedError, error.to_string())
                .await;
        }

        record.finish(MigrationStatus::RolledBack)
    }

    /// Classify, record on the flag, and close out the record. A failed
    /// settings write is logged, not fatal; convergence retries on a later
    /// invocation.
    async fn fail(
        &self,
        record: MigrationRecord,
        feature_name: &str,
        environment: &str,
        kind: FailureKind,
        detail: String,
    ) -> MigrationRecord {
        let status = MigrationStatus::Failed(kind);
        tracing::warn!(
            feature = feature_name,
            environment,
            status = %status.code(),
            detail = %detail,
            "migration step failed"
        );
        let patch = json!({
            SETTING_STATUS: status.code(),
            SETTING_LAST_ERROR: detail,
        });
        if let Err(error) = self
            .features
            .merge_settings(feature_name, environment, &patch, Utc::now())
            .await
        {
            tracing::warn!(
                feature = feature_name,
                environment,
                reason = %error,
                "could not record failure on feature flag"
            );
        }
        record.finish(status)
    }
}

fn recency_window_hours(params: &Value, fallback: i64) -> i64 {
    params
        .get(ROLLBACK_RECENCY_PARAM)
        .and_then(Value::as_i64)
        .filter(|hours| *hours >= 0)
        .unwrap_or(fallback)
}

/// Map a DDL error message onto the failure taxonomy. Anything unrecognized
/// stays an unexpected error.
fn classify_ddl_error(message: &str) -> FailureKind {
    let lowered = message.to_lowercase();
    if lowered.contains("permission denied") || lowered.contains("must be owner") {
        FailureKind::PrivilegeDenied
    } else if lowered.contains("extension") && lowered.contains("not available") {
        FailureKind::CapabilityUnavailable
    } else {
        FailureKind::UnexpectedError
    }
}
