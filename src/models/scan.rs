use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Scan status state machine
// ============================================================================

/// `pending -> {running | queued} -> {completed | failed | cancelled}`;
/// `queued -> running` only through the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ScanStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "queued" => ScanStatus::Queued,
            "running" => ScanStatus::Running,
            "completed" => ScanStatus::Completed,
            "failed" => ScanStatus::Failed,
            "cancelled" | "canceled" => ScanStatus::Cancelled,
            _ => ScanStatus::Pending,
        }
    }
}

impl From<String> for ScanStatus {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

// ============================================================================
// Scanner kind
// ============================================================================

/// Which adapter drives a job. Plugin jobs carry the plugin name as the first
/// token of their argument string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScannerKind {
    LineStream,
    PollTask,
    Plugin,
}

impl Default for ScannerKind {
    fn default() -> Self {
        Self::LineStream
    }
}

impl ScannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::LineStream => "line-stream",
            ScannerKind::PollTask => "poll-task",
            ScannerKind::Plugin => "plugin",
        }
    }
}

impl std::fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ScannerKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "poll-task" | "poll_task" | "openvas" | "gvm" => ScannerKind::PollTask,
            "plugin" | "custom" => ScannerKind::Plugin,
            _ => ScannerKind::LineStream,
        }
    }
}

impl From<String> for ScannerKind {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

// ============================================================================
// Scan job record
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub target_id: Uuid,
    #[sqlx(try_from = "String")]
    pub scanner: ScannerKind,
    pub args: Option<String>,
    pub engine_config_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ScanStatus,
    pub progress: i32,
    pub current_step: Option<String>,
    pub eta_seconds: Option<i64>,
    pub queue_position: i32,
    pub raw_output: Option<Value>,
    pub finding_count: i32,
    #[sqlx(json)]
    pub severity_breakdown: BTreeMap<String, i64>,
    #[sqlx(json)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(create: &ScanJobCreate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_id: create.target_id,
            scanner: create.scanner,
            args: create.args.clone(),
            engine_config_id: create.engine_config_id.clone(),
            status: ScanStatus::Pending,
            progress: 0,
            current_step: None,
            eta_seconds: None,
            queue_position: 0,
            raw_output: None,
            finding_count: 0,
            severity_breakdown: BTreeMap::new(),
            errors: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Seconds since the job started, frozen at completion.
    pub fn elapsed_seconds(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds().max(0))
    }

    pub fn progress_view(&self) -> ScanProgress {
        ScanProgress {
            scan_id: self.id,
            status: self.status,
            progress: self.progress,
            current_step: self.current_step.clone(),
            eta_seconds: self.eta_seconds,
            elapsed_seconds: self.elapsed_seconds(),
            finding_count: self.finding_count,
            severity_breakdown: self.severity_breakdown.clone(),
            queue_position: self.queue_position,
        }
    }

    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            scan_id: self.id,
            target_id: self.target_id,
            scanner: self.scanner,
            args: self.args.clone(),
            engine_config_id: self.engine_config_id.clone(),
            queued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanJobCreate {
    pub target_id: Uuid,
    #[serde(default)]
    pub scanner: ScannerKind,
    pub args: Option<String>,
    pub engine_config_id: Option<String>,
}

/// Status snapshot returned by status queries and pushed to progress observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    pub progress: i32,
    pub current_step: Option<String>,
    pub eta_seconds: Option<i64>,
    pub elapsed_seconds: Option<i64>,
    pub finding_count: i32,
    pub severity_breakdown: BTreeMap<String, i64>,
    pub queue_position: i32,
}

/// Progress report from a running adapter. The stored value never decreases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: i32,
    pub current_step: Option<String>,
    pub eta_seconds: Option<i64>,
}

/// Terminal write applied once per job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: ScanStatus,
    pub raw_output: Option<Value>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn completed(raw_output: Value) -> Self {
        Self {
            status: ScanStatus::Completed,
            raw_output: Some(raw_output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: ScanStatus::Failed,
            raw_output: Some(serde_json::json!({ "error": error })),
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: ScanStatus::Cancelled,
            raw_output: None,
            error: None,
        }
    }

    pub fn current_step(&self) -> &'static str {
        match self.status {
            ScanStatus::Completed => "Scan completed",
            ScanStatus::Cancelled => "Scan cancelled",
            _ => "Scan failed",
        }
    }
}

// ============================================================================
// Admission queue entries and the queue view
// ============================================================================

/// Everything an adapter needs to start a deferred job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub scanner: ScannerKind,
    pub args: Option<String>,
    pub engine_config_id: Option<String>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobView {
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub scanner: ScannerKind,
    pub progress: i32,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJobView {
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub scanner: ScannerKind,
    pub queue_position: usize,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub max_concurrent: usize,
    pub active_count: usize,
    pub queue_size: usize,
    pub active_jobs: Vec<ActiveJobView>,
    pub queued_jobs: Vec<QueuedJobView>,
}
