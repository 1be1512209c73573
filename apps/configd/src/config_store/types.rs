use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordinary operator-created overrides sit here; A/B group members are
/// upserted at a lower value so they win the priority sort.
pub const DEFAULT_OVERRIDE_PRIORITY: i32 = 100;
pub const AB_OVERRIDE_PRIORITY: i32 = 10;

/// One immutable configuration document version. Only the `active` bit ever
/// changes after insert, and only through the atomic activation transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersionRow {
    pub config_key: String,
    pub version: String,
    pub environment: String,
    pub payload: Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub description: Option<String>,
}

/// Per-user override of a configuration document. Lower `priority` wins;
/// expired rows are ignored by resolution and removed only by an explicit
/// sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOverrideRow {
    pub user_id: String,
    pub config_key: String,
    pub value: Value,
    pub priority: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub tag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UserOverrideRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
