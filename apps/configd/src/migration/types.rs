use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Why a coordinator invocation ended without converging anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LockContention,
    FlagMissing,
    FeatureDisabled,
    DependencyUnsatisfied,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockContention => "lock_contention",
            Self::FlagMissing => "flag_missing",
            Self::FeatureDisabled => "feature_disabled",
            Self::DependencyUnsatisfied => "dependency_unsatisfied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    HasRecentData,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HasRecentData => "has_recent_data",
        }
    }
}

/// Classification of a domain failure caught at the coordinator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CapabilityUnavailable,
    PrivilegeDenied,
    InvalidParameters,
    UnexpectedError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CapabilityUnavailable => "capability_unavailable",
            Self::PrivilegeDenied => "privilege_denied",
            Self::InvalidParameters => "invalid_parameters",
            Self::UnexpectedError => "unexpected_error",
        }
    }
}

/// Overall outcome of a coordinator invocation. Communicated through the
/// MigrationRecord, never through process exit codes or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Installed,
    DryRunCompleted,
    RolledBack,
    Failed(FailureKind),
    Skipped(SkipReason),
    Aborted(AbortReason),
}

impl MigrationStatus {
    pub fn code(self) -> String {
        match self {
            Self::Installed => "installed".to_string(),
            Self::DryRunCompleted => "dry_run_completed".to_string(),
            Self::RolledBack => "rolled_back".to_string(),
            Self::Failed(kind) => format!("failed/{}", kind.as_str()),
            Self::Skipped(reason) => format!("skipped/{}", reason.as_str()),
            Self::Aborted(reason) => format!("aborted/{}", reason.as_str()),
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "installed" => return Some(Self::Installed),
            "dry_run_completed" => return Some(Self::DryRunCompleted),
            "rolled_back" => return Some(Self::RolledBack),
            _ => {}
        }
        let (family, detail) = code.split_once('/')?;
        match family {
            "failed" => {
                let kind = match detail {
                    "capability_unavailable" => FailureKind::CapabilityUnavailable,
                    "privilege_denied" => FailureKind::PrivilegeDenied,
                    "invalid_parameters" => FailureKind::InvalidParameters,
                    "unexpected_error" => FailureKind::UnexpectedError,
                    _ => return None,
                };
                Some(Self::Failed(kind))
            }
            "skipped" => {
                let reason = match detail {
                    "lock_contention" => SkipReason::LockContention,
                    "flag_missing" => SkipReason::FlagMissing,
                    "feature_disabled" => SkipReason::FeatureDisabled,
                    "dependency_unsatisfied" => SkipReason::DependencyUnsatisfied,
                    _ => return None,
                };
                Some(Self::Skipped(reason))
            }
            "aborted" => match detail {
                "has_recent_data" => Some(Self::Aborted(AbortReason::HasRecentData)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    DependencyCheck,
    PrivilegeCheck,
    EnsureExtension,
    EnsureTable,
    EnsureIndex,
    EnsureRoutine,
    ShapeCheck,
    RecencyCheck,
    DropRoutine,
    DropTable,
}

impl StepAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DependencyCheck => "dependency_check",
            Self::PrivilegeCheck => "privilege_check",
            Self::EnsureExtension => "ensure_extension",
            Self::EnsureTable => "ensure_table",
            Self::EnsureIndex => "ensure_index",
            Self::EnsureRoutine => "ensure_routine",
            Self::ShapeCheck => "shape_check",
            Self::RecencyCheck => "recency_check",
            Self::DropRoutine => "drop_routine",
            Self::DropTable => "drop_table",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Created,
    AlreadySatisfied,
    Satisfied,
    Mismatch,
    Unsatisfied,
    WouldCreate,
    WouldDrop,
    Dropped,
    AlreadyAbsent,
    Failed,
}

/// One explicit outcome per coordinator step, in execution order. The
/// aggregate of these is the audit trail for a run; nothing is
/// caught-and-forgotten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub target: String,
    pub action: StepAction,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl StepEvent {
    pub fn new(target: impl Into<String>, action: StepAction, outcome: StepOutcome) -> Self {
        Self {
            target: target.into(),
            action,
            outcome,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only audit row for one coordinator invocation. Immutable once
/// written to the sink.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub record_id: String,
    pub migration_name: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: MigrationStatus,
    pub dry_run: bool,
    pub steps: Vec<StepEvent>,
    pub resolved_config: Value,
}

impl MigrationRecord {
    pub fn begin(migration_name: &str, environment: &str, dry_run: bool) -> Self {
        Self {
            record_id: Uuid::now_v7().to_string(),
            migration_name: migration_name.to_string(),
            environment: environment.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: MigrationStatus::Skipped(SkipReason::FlagMissing),
            dry_run,
            steps: Vec::new(),
            resolved_config: Value::Null,
        }
    }

    pub fn finish(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn push(&mut self, step: StepEvent) {
        self.steps.push(step);
    }

    /// Wire representation: the status travels as its code string.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "record_id": self.record_id,
            "migration_name": self.migration_name,
            "environment": self.environment,
            "started_at": self.started_at,
            "completed_at": self.completed_at,
            "status": self.status.code(),
            "dry_run": self.dry_run,
            "steps": serde_json::to_value(&self.steps).unwrap_or(Value::Null),
            "resolved_config": self.resolved_config,
        })
    }
}
