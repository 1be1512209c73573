use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use serde_json::json;

use crate::audit::store::{self as audit_store, AuditStore};
use crate::config_store::resolver::ConfigResolver;
use crate::config_store::store::{self as config_store, ConfigStore};
use crate::config_store::types::ConfigVersionRow;
use crate::features::store::{self as feature_store, FeatureStore};
use crate::features::types::{DependencyPolicy, FeatureFlagRow};
use crate::migration::admin::MemorySchemaAdmin;
use crate::migration::coordinator::{
    CoordinatorConfig, MigrationCoordinator, MIGRATION_DEFAULTS_CONFIG_KEY,
};
use crate::migration::lock::{self as lock, MigrationLock, lock_key};
use crate::migration::schema::Ident;
use crate::migration::types::{
    AbortReason, FailureKind, MigrationStatus, SkipReason, StepAction, StepOutcome,
};

const ENV: &str = "prod";
const FEATURE: &str = "search_v2";
const VECTOR_TABLE: &str = "companion.memory_vectors";

struct Harness {
    features: Arc<dyn FeatureStore>,
    configs: Arc<dyn ConfigStore>,
    admin: Arc<MemorySchemaAdmin>,
    audit: Arc<dyn AuditStore>,
    lock: Arc<dyn MigrationLock>,
    coordinator: MigrationCoordinator,
}

fn harness(policy: DependencyPolicy) -> Result<Harness> {
    let features = feature_store::memory();
    let configs = config_store::memory();
    let resolver = Arc::new(ConfigResolver::new(
        configs.clone(),
        HashMap::new(),
        "COMPANION_MIGTEST",
    ));
    let admin = MemorySchemaAdmin::shared();
    let audit = audit_store::memory();
    let lock = lock::memory();
    let coordinator = MigrationCoordinator::new(
        features.clone(),
        resolver,
        admin.clone(),
        audit.clone(),
        lock.clone(),
        CoordinatorConfig {
            schema: Ident::new("companion")?,
            dependency_policy: policy,
            rollback_recency_hours: 24,
        },
    );
    Ok(Harness {
        features,
        configs,
        admin,
        audit,
        lock,
        coordinator,
    })
}

async fn seed_flag(harness: &Harness, enabled: bool) -> Result<()> {
    let mut flag = FeatureFlagRow::new(FEATURE, ENV);
    flag.enabled = enabled;
    flag.settings = json!({"capability": "vector_search"});
    harness.features.upsert_flag(flag).await?;
    Ok(())
}

async fn publish_active(
    harness: &Harness,
    config_key: &str,
    payload: serde_json::Value,
) -> Result<()> {
    harness
        .configs
        .insert_version(ConfigVersionRow {
            config_key: config_key.to_string(),
            version: "v1".to_string(),
            environment: ENV.to_string(),
            payload,
            active: false,
            created_at: Utc::now(),
            created_by: "tests".to_string(),
            description: None,
        })
        .await?;
    harness.configs.activate_version(config_key, "v1", ENV).await?;
    Ok(())
}

fn flag_setting<'a>(flag: &'a FeatureFlagRow, key: &str) -> Option<&'a serde_json::Value> {
    flag.settings.get(key)
}

#[tokio::test]
async fn disabled_flag_skips_then_enabling_installs_each_object_exactly_once() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, false).await?;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Skipped(SkipReason::FeatureDisabled)
    );
    assert_eq!(harness.admin.mutation_count().await, 0);

    harness
        .features
        .set_enabled(FEATURE, ENV, true, Utc::now())
        .await?;
    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);

    let table_creates = record
        .steps
        .iter()
        .filter(|step| {
            step.action == StepAction::EnsureTable && step.outcome == StepOutcome::Created
        })
        .count();
    let index_creates = record
        .steps
        .iter()
        .filter(|step| {
            step.action == StepAction::EnsureIndex && step.outcome == StepOutcome::Created
        })
        .count();
    assert_eq!(table_creates, 1, "backing table created exactly once");
    // Two secondary indexes plus the ANN index.
    assert_eq!(index_creates, 3);
    assert!(harness.admin.has_table(VECTOR_TABLE).await);
    assert!(harness.admin.has_routine("companion.memory_vectors_search").await);

    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    assert_eq!(flag_setting(&flag, "status"), Some(&json!("installed")));
    assert!(flag_setting(&flag, "resolved").is_some());
    Ok(())
}

#[tokio::test]
async fn rerunning_an_installed_migration_performs_zero_additional_mutations() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;

    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    let mutations_after_first = harness.admin.mutation_count().await;

    let second = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(second.status, MigrationStatus::Installed);
    assert_eq!(harness.admin.mutation_count().await, mutations_after_first);
    assert!(
        second.steps.iter().all(|step| matches!(
            step.outcome,
            StepOutcome::AlreadySatisfied | StepOutcome::Satisfied
        )),
        "every step of the second run must report already satisfied"
    );
    Ok(())
}

#[tokio::test]
async fn contended_lock_skips_immediately_without_blocking() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;

    let key = lock_key(FEATURE, ENV);
    assert!(harness.lock.try_acquire(key).await?);

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Skipped(SkipReason::LockContention)
    );
    assert_eq!(harness.admin.mutation_count().await, 0);

    harness.lock.release(key).await?;
    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);
    Ok(())
}

#[tokio::test]
async fn dry_run_reports_intended_actions_and_mutates_nothing() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;

    let record = harness.coordinator.run_migration(FEATURE, ENV, true).await?;
    assert_eq!(record.status, MigrationStatus::DryRunCompleted);
    assert_eq!(harness.admin.mutation_count().await, 0);
    assert!(!harness.admin.has_table(VECTOR_TABLE).await);
    assert!(
        record
            .steps
            .iter()
            .any(|step| step.outcome == StepOutcome::WouldCreate),
        "dry run must report what it would create"
    );

    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    assert_eq!(
        flag_setting(&flag, "status"),
        Some(&json!("dry_run_completed"))
    );
    Ok(())
}

#[tokio::test]
async fn missing_flag_and_unknown_capability_are_reported_not_thrown() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Skipped(SkipReason::FlagMissing));

    let mut flag = FeatureFlagRow::new(FEATURE, ENV);
    flag.enabled = true;
    flag.settings = json!({"capability": "telepathy"});
    harness.features.upsert_flag(flag).await?;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Failed(FailureKind::InvalidParameters)
    );
    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    assert!(flag_setting(&flag, "last_error").is_some());
    Ok(())
}

#[tokio::test]
async fn missing_extension_marks_the_flag_failed_and_retriable() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    harness.admin.set_available_extensions(&["pg_trgm"]).await;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Failed(FailureKind::CapabilityUnavailable)
    );
    assert!(!harness.admin.has_table(VECTOR_TABLE).await);

    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    assert_eq!(
        flag_setting(&flag, "status"),
        Some(&json!("failed/capability_unavailable"))
    );

    // The failure is retriable: make the extension available and re-run.
    harness
        .admin
        .set_available_extensions(&["vector", "pg_trgm"])
        .await;
    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);
    Ok(())
}

#[tokio::test]
async fn missing_create_privilege_fails_before_any_ddl() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    harness.admin.set_create_privilege(false).await;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Failed(FailureKind::PrivilegeDenied)
    );
    assert!(!harness.admin.has_table(VECTOR_TABLE).await);
    Ok(())
}

#[tokio::test]
async fn shape_mismatch_is_recorded_and_never_auto_altered() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    // Existing table with a narrower vector column than the resolved 1536.
    harness.admin.seed_table(VECTOR_TABLE, Some(768)).await;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);
    assert!(
        record.steps.iter().any(|step| {
            step.action == StepAction::ShapeCheck && step.outcome == StepOutcome::Mismatch
        }),
        "mismatch must appear in the audit trail"
    );
    // No table create was attempted against the mismatched object.
    assert!(
        !record.steps.iter().any(|step| {
            step.action == StepAction::EnsureTable && step.outcome == StepOutcome::Created
        })
    );

    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    let mismatches = flag_setting(&flag, "shape_mismatches").context("mismatches recorded")?;
    assert!(mismatches.to_string().contains("768"));
    Ok(())
}

#[tokio::test]
async fn rollback_refuses_recent_data_unless_forced() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    harness
        .admin
        .seed_rows(VECTOR_TABLE, &[Utc::now() - Duration::minutes(5)])
        .await;

    let record = harness.coordinator.rollback(FEATURE, ENV, false, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Aborted(AbortReason::HasRecentData)
    );
    assert!(harness.admin.has_table(VECTOR_TABLE).await, "no destructive action");
    assert!(harness.admin.has_routine("companion.memory_vectors_search").await);

    let record = harness.coordinator.rollback(FEATURE, ENV, true, false).await?;
    assert_eq!(record.status, MigrationStatus::RolledBack);
    assert!(!harness.admin.has_table(VECTOR_TABLE).await);
    assert!(!harness.admin.has_routine("companion.memory_vectors_search").await);

    let flag = harness
        .features
        .get_flag(FEATURE, ENV)
        .await?
        .context("flag")?;
    assert_eq!(flag_setting(&flag, "status"), Some(&json!("rolled_back")));
    Ok(())
}

#[tokio::test]
async fn rollback_proceeds_when_newest_data_is_outside_the_window() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    harness
        .admin
        .seed_rows(VECTOR_TABLE, &[Utc::now() - Duration::hours(48)])
        .await;

    let record = harness.coordinator.rollback(FEATURE, ENV, false, false).await?;
    assert_eq!(record.status, MigrationStatus::RolledBack);
    assert!(!harness.admin.has_table(VECTOR_TABLE).await);
    Ok(())
}

#[tokio::test]
async fn rollback_recency_window_is_a_resolvable_tunable() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    let mut flag = FeatureFlagRow::new(FEATURE, ENV);
    flag.enabled = true;
    // Widen the window to a week through the flag's own settings.
    flag.settings = json!({"capability": "vector_search", "rollback_recency_hours": 168});
    harness.features.upsert_flag(flag).await?;
    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    harness
        .admin
        .seed_rows(VECTOR_TABLE, &[Utc::now() - Duration::hours(48)])
        .await;

    let record = harness.coordinator.rollback(FEATURE, ENV, false, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Aborted(AbortReason::HasRecentData)
    );
    Ok(())
}

#[tokio::test]
async fn rollback_dry_run_reports_drops_without_dropping() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;
    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    let mutations = harness.admin.mutation_count().await;

    let record = harness.coordinator.rollback(FEATURE, ENV, true, true).await?;
    assert_eq!(record.status, MigrationStatus::DryRunCompleted);
    assert_eq!(harness.admin.mutation_count().await, mutations);
    assert!(harness.admin.has_table(VECTOR_TABLE).await);
    assert!(
        record
            .steps
            .iter()
            .any(|step| step.outcome == StepOutcome::WouldDrop)
    );
    Ok(())
}

#[tokio::test]
async fn parameters_resolve_through_the_ascending_priority_chain() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    // System-wide defaults document.
    publish_active(
        &harness,
        MIGRATION_DEFAULTS_CONFIG_KEY,
        json!({"embedding_dim": 512, "metric": "cosine", "ivfflat_lists": 200}),
    )
    .await?;
    // The feature's own global settings document overrides the metric.
    publish_active(&harness, FEATURE, json!({"metric": "euclidean"})).await?;
    // The flag's settings sit on top and override the list count.
    let mut flag = FeatureFlagRow::new(FEATURE, ENV);
    flag.enabled = true;
    flag.settings = json!({"capability": "vector_search", "ivfflat_lists": 50});
    harness.features.upsert_flag(flag).await?;

    let record = harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);

    let effective = record
        .resolved_config
        .get("effective")
        .context("effective parameters in record")?;
    assert_eq!(effective.get("embedding_dim"), Some(&json!(512)));
    assert_eq!(effective.get("metric"), Some(&json!("euclidean")));
    assert_eq!(
        effective.get("index_params"),
        Some(&json!({"lists": 50}))
    );
    Ok(())
}

#[tokio::test]
async fn dependency_policy_governs_whether_migration_proceeds() -> Result<()> {
    // Advisory: unsatisfied dependency is recorded but does not block.
    let advisory = harness(DependencyPolicy::Advisory)?;
    let mut flag = FeatureFlagRow::new(FEATURE, ENV);
    flag.enabled = true;
    flag.dependencies = vec!["embedding_pipeline".to_string()];
    flag.settings = json!({"capability": "vector_search"});
    advisory.features.upsert_flag(flag.clone()).await?;
    let record = advisory.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(record.status, MigrationStatus::Installed);
    assert!(record.steps.iter().any(|step| {
        step.action == StepAction::DependencyCheck && step.outcome == StepOutcome::Unsatisfied
    }));

    // Enforce: the same flag is skipped.
    let enforce = harness(DependencyPolicy::Enforce)?;
    enforce.features.upsert_flag(flag).await?;
    let record = enforce.coordinator.run_migration(FEATURE, ENV, false).await?;
    assert_eq!(
        record.status,
        MigrationStatus::Skipped(SkipReason::DependencyUnsatisfied)
    );
    assert_eq!(enforce.admin.mutation_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn every_invocation_lands_in_the_audit_log_including_skips() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    harness.coordinator.run_migration(FEATURE, ENV, false).await?; // flag_missing
    seed_flag(&harness, true).await?;
    harness.coordinator.run_migration(FEATURE, ENV, true).await?; // dry run
    harness.coordinator.run_migration(FEATURE, ENV, false).await?; // install

    let records = harness.audit.list_records(FEATURE, ENV, 10).await?;
    assert_eq!(records.len(), 3);
    // Newest first.
    assert_eq!(records[0].status, MigrationStatus::Installed);
    assert_eq!(records[1].status, MigrationStatus::DryRunCompleted);
    assert_eq!(
        records[2].status,
        MigrationStatus::Skipped(SkipReason::FlagMissing)
    );
    Ok(())
}

#[tokio::test]
async fn status_probe_reports_live_state_and_never_mutates() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    seed_flag(&harness, true).await?;

    let before = harness.coordinator.status(FEATURE, ENV).await?;
    assert_eq!(before.get("table_exists"), Some(&json!(false)));

    harness.coordinator.run_migration(FEATURE, ENV, false).await?;
    let mutations = harness.admin.mutation_count().await;

    let after = harness.coordinator.status(FEATURE, ENV).await?;
    assert_eq!(after.get("table_exists"), Some(&json!(true)));
    assert_eq!(after.get("row_count"), Some(&json!(0)));
    assert_eq!(after.get("search_index_exists"), Some(&json!(true)));
    assert_eq!(harness.admin.mutation_count().await, mutations);

    let absent = harness.coordinator.status("ghost_feature", ENV).await?;
    assert_eq!(absent.get("flag"), Some(&serde_json::Value::Null));
    Ok(())
}

#[tokio::test]
async fn lock_keys_are_deterministic_and_scoped_to_feature_and_environment() -> Result<()> {
    assert_eq!(lock_key(FEATURE, ENV), lock_key(FEATURE, ENV));
    if lock_key(FEATURE, "staging") == lock_key(FEATURE, ENV) {
        return Err(anyhow!("environments must not share lock keys"));
    }
    if lock_key("fuzzy_recall", ENV) == lock_key(FEATURE, ENV) {
        return Err(anyhow!("features must not share lock keys"));
    }
    Ok(())
}

#[tokio::test]
async fn fuzzy_text_capability_provisions_trigram_objects() -> Result<()> {
    let harness = harness(DependencyPolicy::Advisory)?;
    let mut flag = FeatureFlagRow::new("fuzzy_recall", ENV);
    flag.enabled = true;
    flag.settings = json!({"capability": "fuzzy_text", "table": "memory_texts"});
    harness.features.upsert_flag(flag).await?;

    let record = harness
        .coordinator
        .run_migration("fuzzy_recall", ENV, false)
        .await?;
    assert_eq!(record.status, MigrationStatus::Installed);
    assert!(harness.admin.has_table("companion.memory_texts").await);
    assert!(harness.admin.has_routine("companion.memory_texts_match").await);
    Ok(())
}
