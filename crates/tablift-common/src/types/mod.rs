//! Core domain types shared by the ingest and migrate crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Migration job status
///
/// Status only advances along this chain or jumps to `Failed`; there are no
/// backward transitions. `can_transition_to` is the single source of truth
/// and the job store refuses updates that violate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Started,
    Ingesting,
    IngestCompleted,
    Validating,
    Validated,
    Applying,
    Applied,
    Reconciling,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "STARTED",
            JobStatus::Ingesting => "INGESTING",
            JobStatus::IngestCompleted => "INGEST_COMPLETED",
            JobStatus::Validating => "VALIDATING",
            JobStatus::Validated => "VALIDATED",
            JobStatus::Applying => "APPLYING",
            JobStatus::Applied => "APPLIED",
            JobStatus::Reconciling => "RECONCILING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Position in the ordered chain; `Failed` sits outside it.
    fn ordinal(&self) -> Option<u8> {
        match self {
            JobStatus::Started => Some(0),
            JobStatus::Ingesting => Some(1),
            JobStatus::IngestCompleted => Some(2),
            JobStatus::Validating => Some(3),
            JobStatus::Validated => Some(4),
            JobStatus::Applying => Some(5),
            JobStatus::Applied => Some(6),
            JobStatus::Reconciling => Some(7),
            JobStatus::Completed => Some(8),
            JobStatus::Failed => None,
        }
    }

    /// True when a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        if next == JobStatus::Failed {
            return *self != JobStatus::Completed;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "STARTED" => JobStatus::Started,
            "INGESTING" => JobStatus::Ingesting,
            "INGEST_COMPLETED" => JobStatus::IngestCompleted,
            "VALIDATING" => JobStatus::Validating,
            "VALIDATED" => JobStatus::Validated,
            "APPLYING" => JobStatus::Applying,
            "APPLIED" => JobStatus::Applied,
            "RECONCILING" => JobStatus::Reconciling,
            "COMPLETED" => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Ingest,
    Validate,
    Apply,
    Reconcile,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ingest => "INGEST",
            Phase::Validate => "VALIDATE",
            Phase::Apply => "APPLY",
            Phase::Reconcile => "RECONCILE",
        }
    }

    /// Phase order as driven by the orchestrator.
    pub fn all() -> [Phase; 4] {
        [Phase::Ingest, Phase::Validate, Phase::Apply, Phase::Reconcile]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared type of a bound record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Decimal,
    Bool,
    Date,
    DateTime,
    Enum,
}

/// Per-binding coercion hint; overrides auto-detection when not `General`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellFormatHint {
    #[default]
    General,
    Identifier,
    Text,
    Date,
    Number,
}

/// Checkpoint lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Active,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "ACTIVE",
            CheckpointStatus::Completed => "COMPLETED",
            CheckpointStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of one streaming parse over a workbook source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub processed_rows: u64,
    pub error_count: u64,
    pub duration_ms: u64,
    /// Records per second over the whole parse
    pub throughput: f64,
}

impl ProcessingResult {
    pub fn new(processed_rows: u64, error_count: u64, duration_ms: u64) -> Self {
        let throughput = if duration_ms > 0 {
            processed_rows as f64 * 1000.0 / duration_ms as f64
        } else {
            0.0
        };
        Self {
            processed_rows,
            error_count,
            duration_ms,
            throughput,
        }
    }
}

/// User-visible outcome of a whole migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub job_id: String,
    pub status: JobStatus,
    pub file_name: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub valid_rows: i64,
    pub error_rows: i64,
    pub inserted_rows: i64,
    pub phase: Phase,
    pub progress_percent: f64,
    pub ingest_time_ms: u64,
    pub validate_time_ms: u64,
    pub apply_time_ms: u64,
    pub reconcile_time_ms: u64,
    pub error_message: Option<String>,
}

/// Outcome of a checkpoint-driven (resumable) processing run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverableProcessingResult {
    pub session_id: String,
    pub success: bool,
    pub processed_batches: u64,
    pub processed_rows: u64,
    pub progress_percent: f64,
    pub checkpoint: Option<serde_json::Value>,
}

/// Which of the two legal job-id formats to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobIdFormat {
    /// `JOB_<millis>_<4-hex>`
    #[default]
    Timestamped,
    /// `JOB-YYYYMMDD-NNN` with a caller-supplied per-day sequence
    Dated,
}

/// Generate a job id in the timestamped format.
pub fn timestamped_job_id(now: DateTime<Utc>) -> String {
    let rand = &Uuid::new_v4().simple().to_string()[..4];
    format!("JOB_{}_{}", now.timestamp_millis(), rand)
}

/// Generate a job id in the dated format. `sequence` is the per-day counter
/// maintained by the job store.
pub fn dated_job_id(now: DateTime<Utc>, sequence: u32) -> String {
    format!("JOB-{}-{:03}", now.format("%Y%m%d"), sequence)
}
