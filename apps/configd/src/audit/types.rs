use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEventKind {
    VersionPublished,
    VersionActivated,
    OverrideUpserted,
    OverridesSwept,
    FeatureToggled,
}

impl ConfigEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionPublished => "version_published",
            Self::VersionActivated => "version_activated",
            Self::OverrideUpserted => "override_upserted",
            Self::OverridesSwept => "overrides_swept",
            Self::FeatureToggled => "feature_toggled",
        }
    }

    pub fn from_str_code(code: &str) -> Option<Self> {
        match code {
            "version_published" => Some(Self::VersionPublished),
            "version_activated" => Some(Self::VersionActivated),
            "override_upserted" => Some(Self::OverrideUpserted),
            "overrides_swept" => Some(Self::OverridesSwept),
            "feature_toggled" => Some(Self::FeatureToggled),
            _ => None,
        }
    }
}

/// Append-only audit row for a configuration mutation (version publish or
/// activation, flag toggle, override upsert, sweep).
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub event_id: String,
    pub environment: String,
    pub kind: ConfigEventKind,
    pub subject: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl ConfigChangeEvent {
    pub fn new(environment: &str, kind: ConfigEventKind, subject: &str, detail: Value) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            environment: environment.to_string(),
            kind,
            subject: subject.to_string(),
            detail,
            created_at: Utc::now(),
        }
    }
}
