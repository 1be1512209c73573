use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use crate::audit::store as audit_store;
use crate::audit::types::ConfigEventKind;
use crate::config_store::resolver::{
    ConfigResolver, apply_layer, env_overrides, parse_env_value, set_path,
};
use crate::config_store::service::{ConfigAdmin, ConfigAdminError};
use crate::config_store::store::{self, ConfigStore};
use crate::config_store::types::UserOverrideRow;

const ENV: &str = "prod";

fn resolver_over(store: Arc<dyn ConfigStore>) -> ConfigResolver {
    ConfigResolver::new(store, HashMap::new(), "COMPANION_TEST")
}

#[tokio::test]
async fn activating_a_newer_version_leaves_exactly_one_active_row() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());

    admin
        .publish_version("memory", "v1", ENV, json!({"limit": 5}), "ops", None)
        .await?;
    admin.activate_version("memory", "v1", ENV).await?;
    admin
        .publish_version("memory", "v2", ENV, json!({"limit": 9}), "ops", None)
        .await?;
    admin.activate_version("memory", "v2", ENV).await?;

    let v1 = store
        .get_version("memory", "v1", ENV)
        .await?
        .context("v1 row")?;
    let v2 = store
        .get_version("memory", "v2", ENV)
        .await?
        .context("v2 row")?;
    assert!(!v1.active);
    assert!(v2.active);

    let active = store
        .get_active_payload("memory", ENV)
        .await?
        .context("active payload")?;
    assert_eq!(active, json!({"limit": 9}));
    Ok(())
}

#[tokio::test]
async fn concurrent_activations_race_to_exactly_one_active_row() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());

    admin
        .publish_version("memory", "v1", ENV, json!({"v": 1}), "ops", None)
        .await?;
    admin
        .publish_version("memory", "v2", ENV, json!({"v": 2}), "ops", None)
        .await?;

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.activate_version("memory", "v1", ENV).await })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.activate_version("memory", "v2", ENV).await })
    };
    a.await??;
    b.await??;

    let v1 = store
        .get_version("memory", "v1", ENV)
        .await?
        .context("v1 row")?;
    let v2 = store
        .get_version("memory", "v2", ENV)
        .await?
        .context("v2 row")?;
    assert_eq!(
        [v1.active, v2.active].iter().filter(|active| **active).count(),
        1,
        "exactly one version must stay active after racing activations"
    );
    Ok(())
}

#[tokio::test]
async fn resolve_without_user_matches_resolve_for_user_without_override() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());
    admin
        .publish_version("thresholds", "v1", ENV, json!({"semantic": 0.5}), "ops", None)
        .await?;
    admin.activate_version("thresholds", "v1", ENV).await?;

    let resolver = resolver_over(store);
    let global = resolver.resolve("thresholds", None, ENV).await?;
    let for_user = resolver.resolve("thresholds", Some("user-7"), ENV).await?;
    assert_eq!(global, for_user);
    assert_eq!(global, json!({"semantic": 0.5}));
    Ok(())
}

#[tokio::test]
async fn expired_override_never_appears_in_resolved_output() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());
    admin
        .publish_version("thresholds", "v1", ENV, json!({"semantic": 0.5}), "ops", None)
        .await?;
    admin.activate_version("thresholds", "v1", ENV).await?;

    // Highest possible precedence, but already expired.
    store
        .upsert_override(UserOverrideRow {
            user_id: "user-7".to_string(),
            config_key: "thresholds".to_string(),
            value: json!({"semantic": 0.99}),
            priority: 1,
            expires_at: Some(Utc::now() - Duration::hours(1)),
            tag: None,
            updated_at: Utc::now() - Duration::hours(2),
        })
        .await?;

    let resolver = resolver_over(store);
    let resolved = resolver.resolve("thresholds", Some("user-7"), ENV).await?;
    assert_eq!(resolved, json!({"semantic": 0.5}));
    Ok(())
}

#[tokio::test]
async fn override_merge_is_shallow_not_deep() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());
    admin
        .publish_version("memory", "v1", ENV, json!({"a": {"x": 1, "y": 2}}), "ops", None)
        .await?;
    admin.activate_version("memory", "v1", ENV).await?;
    admin
        .set_user_override(ENV, "user-7", "memory", json!({"a": {"y": 9}}), None, None, None)
        .await?;

    let resolver = resolver_over(store);
    let resolved = resolver.resolve("memory", Some("user-7"), ENV).await?;
    // The override's nested object replaces the global one wholesale: x is gone.
    assert_eq!(resolved, json!({"a": {"y": 9}}));
    Ok(())
}

#[tokio::test]
async fn missing_config_resolves_to_empty_document() -> Result<()> {
    let resolver = resolver_over(store::memory());
    let resolved = resolver.resolve("nonexistent", Some("user-7"), ENV).await?;
    assert_eq!(resolved, json!({}));
    Ok(())
}

#[tokio::test]
async fn fallback_file_layer_sits_below_the_active_version() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut file = std::fs::File::create(dir.path().join("memory.yml"))?;
    writeln!(file, "limit: 3")?;
    writeln!(file, "window_days: 30")?;
    drop(file);

    let fallback = ConfigResolver::load_fallback_dir(dir.path());
    assert_eq!(
        fallback.get("memory"),
        Some(&json!({"limit": 3, "window_days": 30}))
    );

    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());
    admin
        .publish_version("memory", "v1", ENV, json!({"limit": 8}), "ops", None)
        .await?;
    admin.activate_version("memory", "v1", ENV).await?;

    let resolver = ConfigResolver::new(store, fallback, "COMPANION_TEST");
    let resolved = resolver.resolve("memory", None, ENV).await?;
    // Active version wins on limit; fallback still contributes window_days.
    assert_eq!(resolved, json!({"limit": 8, "window_days": 30}));
    Ok(())
}

#[tokio::test]
async fn duplicate_publish_conflicts_and_unknown_activation_is_not_found() -> Result<()> {
    let admin = ConfigAdmin::new(store::memory(), audit_store::memory());
    admin
        .publish_version("memory", "v1", ENV, json!({}), "ops", None)
        .await?;
    match admin
        .publish_version("memory", "v1", ENV, json!({}), "ops", None)
        .await
    {
        Err(ConfigAdminError::Conflict(_)) => {}
        other => return Err(anyhow!("expected conflict, got {other:?}")),
    }
    match admin.activate_version("memory", "v9", ENV).await {
        Err(ConfigAdminError::NotFound(_)) => {}
        other => return Err(anyhow!("expected not found, got {other:?}")),
    }
    Ok(())
}

#[tokio::test]
async fn config_mutations_append_audit_events() -> Result<()> {
    let audit = audit_store::memory();
    let admin = ConfigAdmin::new(store::memory(), audit.clone());
    admin
        .publish_version("memory", "v1", ENV, json!({}), "ops", None)
        .await?;
    admin.activate_version("memory", "v1", ENV).await?;
    admin
        .set_user_override(ENV, "user-7", "memory", json!({"limit": 1}), None, Some(24), None)
        .await?;

    let events = audit.list_config_events(ENV, 10).await?;
    let kinds: Vec<ConfigEventKind> = events.iter().map(|event| event.kind).collect();
    assert!(kinds.contains(&ConfigEventKind::VersionPublished));
    assert!(kinds.contains(&ConfigEventKind::VersionActivated));
    assert!(kinds.contains(&ConfigEventKind::OverrideUpserted));
    Ok(())
}

#[test]
fn env_override_names_map_onto_nested_paths_with_typed_values() {
    let vars = vec![
        ("COMPANION__MEMORY__SEARCH__LIMIT".to_string(), "5".to_string()),
        ("COMPANION__MEMORY__SEARCH__FUZZY".to_string(), "true".to_string()),
        ("COMPANION__MEMORY__LABEL".to_string(), "short-term".to_string()),
        ("COMPANION__OTHER__IGNORED".to_string(), "1".to_string()),
        ("UNRELATED".to_string(), "x".to_string()),
    ];
    let overrides = env_overrides("COMPANION", "memory", vars.into_iter());

    let mut document = serde_json::Map::new();
    apply_layer(&mut document, &json!({"search": {"limit": 1}}));
    for (path, value) in overrides {
        set_path(&mut document, &path, value);
    }
    assert_eq!(
        Value::Object(document),
        json!({
            "label": "short-term",
            "search": {"limit": 5, "fuzzy": true},
        })
    );
}

#[test]
fn env_values_parse_into_the_most_specific_json_type() {
    assert_eq!(parse_env_value("true"), json!(true));
    assert_eq!(parse_env_value("False"), json!(false));
    assert_eq!(parse_env_value("null"), Value::Null);
    assert_eq!(parse_env_value(""), Value::Null);
    assert_eq!(parse_env_value("42"), json!(42));
    assert_eq!(parse_env_value("0.25"), json!(0.25));
    assert_eq!(parse_env_value("[1,2]"), json!([1, 2]));
    assert_eq!(parse_env_value(r#"{"a":1}"#), json!({"a": 1}));
    assert_eq!(parse_env_value("cosine"), json!("cosine"));
}
