use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Settings keys written back by the migration coordinator. These are
/// excluded when flag settings feed the parameter-resolution chain.
pub const SETTING_STATUS: &str = "status";
pub const SETTING_RESOLVED: &str = "resolved";
pub const SETTING_LAST_ERROR: &str = "last_error";
pub const SETTING_SHAPE_MISMATCHES: &str = "shape_mismatches";

pub const RESERVED_SETTING_KEYS: [&str; 4] = [
    SETTING_STATUS,
    SETTING_RESOLVED,
    SETTING_LAST_ERROR,
    SETTING_SHAPE_MISMATCHES,
];

/// Per-environment capability toggle. `settings` is a free-form document:
/// operator tunables plus the coordinator's reserved status keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagRow {
    pub feature_name: String,
    pub environment: String,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    pub settings: Value,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlagRow {
    pub fn new(feature_name: &str, environment: &str) -> Self {
        Self {
            feature_name: feature_name.to_string(),
            environment: environment.to_string(),
            enabled: false,
            dependencies: Vec::new(),
            settings: Value::Object(serde_json::Map::new()),
            updated_at: Utc::now(),
        }
    }

    /// Flag settings minus the coordinator's reserved keys — the slice that
    /// participates in parameter resolution.
    pub fn tunable_settings(&self) -> Value {
        match &self.settings {
            Value::Object(entries) => Value::Object(
                entries
                    .iter()
                    .filter(|(key, _)| !RESERVED_SETTING_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            _ => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Whether an unsatisfied feature dependency blocks availability and
/// migration, or is merely logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    #[default]
    Advisory,
    Enforce,
}

impl DependencyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advisory => "advisory",
            Self::Enforce => "enforce",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "advisory" => Some(Self::Advisory),
            "enforce" => Some(Self::Enforce),
            _ => None,
        }
    }
}
