use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use serde_json::json;

use crate::ab::service::{AbTestError, AbTestHelper};
use crate::ab::types::OverrideGroupRequest;
use crate::audit::store as audit_store;
use crate::config_store::resolver::ConfigResolver;
use crate::config_store::service::ConfigAdmin;
use crate::config_store::store::{self, ConfigStore};
use crate::config_store::types::UserOverrideRow;

const ENV: &str = "prod";

fn helper(store: Arc<dyn ConfigStore>) -> AbTestHelper {
    AbTestHelper::new(store, audit_store::memory(), ENV)
}

fn group_request(test_name: &str, users: &[&str], days: i64) -> OverrideGroupRequest {
    OverrideGroupRequest {
        base_config_key: "thresholds".to_string(),
        test_name: test_name.to_string(),
        user_ids: users.iter().map(|user| user.to_string()).collect(),
        overrides: json!({"semantic": 0.7}),
        duration_days: days,
    }
}

#[tokio::test]
async fn group_members_resolve_to_the_test_overrides() -> Result<()> {
    let store = store::memory();
    let admin = ConfigAdmin::new(store.clone(), audit_store::memory());
    admin
        .publish_version("thresholds", "v1", ENV, json!({"semantic": 0.5}), "ops", None)
        .await?;
    admin.activate_version("thresholds", "v1", ENV).await?;

    let helper = helper(store.clone());
    let enrolled = helper
        .create_override_group(group_request("exp_semantic_07", &["u1", "u2"], 14))
        .await?;
    assert_eq!(enrolled, 2);

    let resolver = ConfigResolver::new(store, HashMap::new(), "COMPANION_ABTEST");
    let member = resolver.resolve("thresholds", Some("u1"), ENV).await?;
    assert_eq!(member, json!({"semantic": 0.7}));
    let outsider = resolver.resolve("thresholds", Some("u3"), ENV).await?;
    assert_eq!(outsider, json!({"semantic": 0.5}));
    Ok(())
}

#[tokio::test]
async fn group_overrides_take_precedence_over_ordinary_overrides() -> Result<()> {
    let store = store::memory();
    let helper = helper(store.clone());
    helper
        .create_override_group(group_request("exp_semantic_07", &["u1"], 14))
        .await?;

    let row = store
        .best_override("u1", "thresholds", Utc::now())
        .await?
        .context("override present")?;
    assert!(
        row.priority < crate::config_store::types::DEFAULT_OVERRIDE_PRIORITY,
        "group members must outrank ordinary overrides"
    );
    assert_eq!(row.tag.as_deref(), Some("exp_semantic_07"));
    Ok(())
}

#[tokio::test]
async fn groups_aggregate_by_tag_with_expiry_state() -> Result<()> {
    let store = store::memory();
    let helper = helper(store.clone());
    helper
        .create_override_group(group_request("exp_live", &["u1", "u2", "u3"], 30))
        .await?;

    // An already-expired group, staged directly.
    store
        .upsert_override(UserOverrideRow {
            user_id: "u9".to_string(),
            config_key: "thresholds".to_string(),
            value: json!({"semantic": 0.9}),
            priority: crate::config_store::types::AB_OVERRIDE_PRIORITY,
            expires_at: Some(Utc::now() - Duration::days(1)),
            tag: Some("exp_stale".to_string()),
            updated_at: Utc::now() - Duration::days(15),
        })
        .await?;

    let groups = helper.list_groups().await?;
    assert_eq!(groups.len(), 2);
    let live = groups
        .iter()
        .find(|group| group.test_name == "exp_live")
        .context("live group")?;
    assert_eq!(live.size, 3);
    assert!(live.active);
    let stale = groups
        .iter()
        .find(|group| group.test_name == "exp_stale")
        .context("stale group")?;
    assert!(!stale.active);
    Ok(())
}

#[tokio::test]
async fn sweep_deletes_only_expired_rows_and_reports_the_count() -> Result<()> {
    let store = store::memory();
    let helper = helper(store.clone());
    helper
        .create_override_group(group_request("exp_live", &["u1"], 30))
        .await?;
    store
        .upsert_override(UserOverrideRow {
            user_id: "u9".to_string(),
            config_key: "thresholds".to_string(),
            value: json!({}),
            priority: 100,
            expires_at: Some(Utc::now() - Duration::hours(1)),
            tag: None,
            updated_at: Utc::now() - Duration::days(2),
        })
        .await?;

    assert_eq!(helper.sweep_expired().await?, 1);
    // Second sweep finds nothing; live rows survive.
    assert_eq!(helper.sweep_expired().await?, 0);
    assert!(
        store
            .best_override("u1", "thresholds", Utc::now())
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn invalid_group_requests_are_rejected() -> Result<()> {
    let helper = helper(store::memory());
    let cases = [
        group_request("", &["u1"], 14),
        group_request("exp", &[], 14),
        group_request("exp", &["u1"], 0),
    ];
    for request in cases {
        match helper.create_override_group(request).await {
            Err(AbTestError::InvalidRequest(_)) => {}
            other => return Err(anyhow!("expected invalid request, got {other:?}")),
        }
    }
    Ok(())
}
