use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    PartialSuccess,
    Failed,
    Timeout,
}

text_enum!(RunStatus {
    Queued => "queued",
    Running => "running",
    Success => "success",
    PartialSuccess => "partial_success",
    Failed => "failed",
    Timeout => "timeout",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::PartialSuccess | Self::Failed | Self::Timeout
        )
    }
}

/// Summary metrics from the harness's final JSON line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regressions: Vec<String>,
}

/// One sandboxed execution of an SDK scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRun {
    pub id: String,
    pub seed: u64,
    pub sdk_language: String,
    pub scenario: Value,
    pub patch_reference: Option<String>,
    pub status: RunStatus,
    pub container_id: Option<String>,
    pub metrics: Option<RunMetrics>,
    pub artifact_key: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    Started,
    Timeout,
    Completed,
    Failed,
}

text_enum!(JournalEvent {
    Started => "started",
    Timeout => "timeout",
    Completed => "completed",
    Failed => "failed",
});

impl JournalEvent {
    /// Exactly one terminal entry is allowed per run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Append-only transition record, totally ordered per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub run_id: String,
    pub event: JournalEvent,
    pub detail: Option<String>,
    pub created_at: i64,
}

/// Aggregated, de-identified error derived from run logs after the run
/// reaches a terminal status. Feeds offline training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizedError {
    pub id: String,
    pub run_id: String,
    pub error_signature: String,
    pub category: String,
    pub sdk_language: String,
    /// Share of total requests affected, in `[0, 1]`.
    pub frequency: f64,
    pub context_hash: String,
}
