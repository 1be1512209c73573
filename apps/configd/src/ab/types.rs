use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideGroupRequest {
    pub base_config_key: String,
    pub test_name: String,
    pub user_ids: Vec<String>,
    pub overrides: Value,
    pub duration_days: i64,
}

/// Aggregated view of one tagged override group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideGroupSummary {
    pub test_name: String,
    pub config_key: String,
    pub size: usize,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}
