use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;

use crate::audit::store as audit_store;
use crate::audit::types::ConfigEventKind;
use crate::features::registry::{FeatureRegistry, FeatureRegistryError};
use crate::features::store::{self, FeatureStore, FeatureStoreError};
use crate::features::types::{DependencyPolicy, FeatureFlagRow};

const ENV: &str = "prod";

fn registry(policy: DependencyPolicy) -> FeatureRegistry {
    FeatureRegistry::new(store::memory(), audit_store::memory(), policy)
}

#[tokio::test]
async fn missing_or_disabled_flag_is_not_available() -> Result<()> {
    let registry = registry(DependencyPolicy::Advisory);
    assert!(!registry.is_available("search_v2", ENV).await?);

    registry
        .upsert_flag(FeatureFlagRow::new("search_v2", ENV))
        .await?;
    assert!(!registry.is_available("search_v2", ENV).await?);

    registry.set_enabled("search_v2", ENV, true).await?;
    assert!(registry.is_available("search_v2", ENV).await?);
    Ok(())
}

#[tokio::test]
async fn advisory_policy_keeps_feature_available_despite_missing_dependency() -> Result<()> {
    let registry = registry(DependencyPolicy::Advisory);
    let mut flag = FeatureFlagRow::new("search_v2", ENV);
    flag.enabled = true;
    flag.dependencies = vec!["embedding_pipeline".to_string()];
    registry.upsert_flag(flag).await?;

    assert!(registry.is_available("search_v2", ENV).await?);
    Ok(())
}

#[tokio::test]
async fn enforce_policy_blocks_availability_until_dependency_is_enabled() -> Result<()> {
    let registry = registry(DependencyPolicy::Enforce);
    let mut flag = FeatureFlagRow::new("search_v2", ENV);
    flag.enabled = true;
    flag.dependencies = vec!["embedding_pipeline".to_string()];
    registry.upsert_flag(flag).await?;

    assert!(!registry.is_available("search_v2", ENV).await?);

    let mut dependency = FeatureFlagRow::new("embedding_pipeline", ENV);
    dependency.enabled = true;
    registry.upsert_flag(dependency).await?;
    assert!(registry.is_available("search_v2", ENV).await?);
    Ok(())
}

#[tokio::test]
async fn toggling_an_unknown_flag_is_not_found() -> Result<()> {
    let registry = registry(DependencyPolicy::Advisory);
    match registry.set_enabled("ghost", ENV, true).await {
        Err(FeatureRegistryError::NotFound(_)) => Ok(()),
        other => Err(anyhow!("expected not found, got {other:?}")),
    }
}

#[tokio::test]
async fn toggles_append_audit_events() -> Result<()> {
    let audit = audit_store::memory();
    let registry = FeatureRegistry::new(store::memory(), audit.clone(), DependencyPolicy::Advisory);
    registry
        .upsert_flag(FeatureFlagRow::new("search_v2", ENV))
        .await?;
    registry.set_enabled("search_v2", ENV, true).await?;

    let events = audit.list_config_events(ENV, 10).await?;
    assert!(events
        .iter()
        .any(|event| event.kind == ConfigEventKind::FeatureToggled && event.subject == "search_v2"));
    Ok(())
}

#[tokio::test]
async fn settings_merge_is_shallow_and_null_deletes() -> Result<()> {
    let store = store::memory();
    let mut flag = FeatureFlagRow::new("search_v2", ENV);
    flag.settings = json!({"embedding_dim": 768, "last_error": "boom"});
    store.upsert_flag(flag).await?;

    store
        .merge_settings(
            "search_v2",
            ENV,
            &json!({"status": "installed", "last_error": null}),
            Utc::now(),
        )
        .await?;

    let updated = store
        .get_flag("search_v2", ENV)
        .await?
        .ok_or_else(|| anyhow!("flag missing"))?;
    assert_eq!(
        updated.settings,
        json!({"embedding_dim": 768, "status": "installed"})
    );
    // Reserved keys stay out of the tunables used for parameter resolution.
    assert_eq!(updated.tunable_settings(), json!({"embedding_dim": 768}));
    Ok(())
}

#[tokio::test]
async fn merge_settings_on_unknown_flag_is_not_found() -> Result<()> {
    let store = store::memory();
    match store
        .merge_settings("ghost", ENV, &json!({"status": "installed"}), Utc::now())
        .await
    {
        Err(FeatureStoreError::NotFound(_)) => Ok(()),
        other => Err(anyhow!("expected not found, got {other:?}")),
    }
}
