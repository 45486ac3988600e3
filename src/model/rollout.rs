use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    Random,
    Geo,
    MerchantTier,
}

text_enum!(RolloutStrategy {
    Random => "random",
    Geo => "geo",
    MerchantTier => "merchant_tier",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Active,
    Paused,
    Completed,
    RolledBack,
}

text_enum!(RolloutStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    RolledBack => "rolled_back",
});

impl RolloutStatus {
    /// Terminal states are monotonic: no transitions out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

/// Staged exposure of one plugin version. Latest row per plugin wins for
/// targeting queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub id: String,
    pub plugin_name: String,
    pub version: String,
    pub percentage: f64,
    pub strategy: RolloutStrategy,
    pub target_countries: Option<Vec<String>>,
    pub target_tiers: Option<Vec<String>>,
    pub error_threshold: f64,
    pub status: RolloutStatus,
    pub metadata: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    Manual,
    Auto,
}

text_enum!(RollbackTrigger {
    Manual => "manual",
    Auto => "auto",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAttempt {
    pub id: String,
    pub merchant: String,
    pub plugin: String,
    pub from_version: String,
    pub to_version: String,
    pub trigger: RollbackTrigger,
    pub reason: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub files_restored: Option<bool>,
    pub db_restored: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Completed,
    Failed,
}

text_enum!(BackupStatus {
    Completed => "completed",
    Failed => "failed",
});

/// Pre-upgrade artifact a rollback restores from. Only `completed` backups
/// that have not passed `expires_at` are eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginBackup {
    pub id: String,
    pub merchant: String,
    pub plugin: String,
    pub version: String,
    pub path: String,
    pub db_snapshot: Option<String>,
    pub size_bytes: i64,
    pub status: BackupStatus,
    pub expires_at: i64,
    pub metadata: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Success,
    Failed,
}

text_enum!(UpgradeOutcome {
    Success => "success",
    Failed => "failed",
});

/// Outcome of one applied upgrade on one merchant. The auto-pause sweep
/// derives the observed error rate from these rows. `rollback_status`
/// records the last rollback attempt for the `(merchant, plugin)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginUpgradeLog {
    pub id: String,
    pub merchant: String,
    pub plugin: String,
    pub version: String,
    pub status: UpgradeOutcome,
    pub rollback_status: Option<String>,
    pub created_at: i64,
}
