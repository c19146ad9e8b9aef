//! Shared domain types: persisted rows and in-flight message payloads.
//!
//! Enums round-trip through `text` columns via `as_str()`/`parse()` rather
//! than sqlx's native Postgres enum mapping, keeping migrations to plain
//! `text` + `CHECK` constraints instead of `CREATE TYPE ... AS ENUM`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunType {
    Full,
    Incremental,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Full => "full",
            RunType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RunType::Full),
            "incremental" => Some(RunType::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Stalled,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stalled => "stalled",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "stalled" => Some(RunStatus::Stalled),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

/// One ingestion attempt against a named feed. `run_metadata` row.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: Uuid,
    pub feed: String,
    pub run_type: RunType,
    pub expected_workers: i32,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub consolidation_started_at: Option<DateTime<Utc>>,
    pub consolidation_completed_at: Option<DateTime<Utc>>,
    pub consolidation_processed: i64,
    pub consolidation_errors: i64,
    pub consolidation_total: i64,
}

// ---------------------------------------------------------------------------
// Partition Progress
// ---------------------------------------------------------------------------

/// Durable per-partition offset + terminal flags. `partition_progress` row,
/// PK `(run_id, partition_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    pub run_id: Uuid,
    pub partition_id: String,
    pub next_offset: i64,
    pub completed: bool,
    pub failed: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Worker Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRunStatus {
    Running,
    Completed,
    Failed,
}

impl WorkerRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRunStatus::Running => "running",
            WorkerRunStatus::Completed => "completed",
            WorkerRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(WorkerRunStatus::Running),
            "completed" => Some(WorkerRunStatus::Completed),
            "failed" => Some(WorkerRunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-(run, partition) bookkeeping of the most recent worker attempt.
/// `worker_runs` row, unique per `(run_id, partition_id)`.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub partition_id: String,
    pub worker_id: String,
    pub status: WorkerRunStatus,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub work_item_payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// In-flight message payloads
// ---------------------------------------------------------------------------

/// `{ feed, run_id, trace_id, partition_id, min_price, max_price,
///   estimated_records, offset, limit, updated_from?, updated_to? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub feed: String,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    pub partition_id: String,
    pub min_price: i64,
    pub max_price: i64,
    pub estimated_records: i64,
    pub offset: i64,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_to: Option<DateTime<Utc>>,
}

/// `{ feed, run_id, trace_id, worker_id, partition_id, records_processed,
///   status, error? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkDone {
    pub feed: String,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    pub worker_id: String,
    pub partition_id: String,
    pub records_processed: i64,
    pub status: WorkerRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `{ feed, run_id, trace_id, force? }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consolidate {
    pub feed: String,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    #[serde(default)]
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Raw record / watermark
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsolidationStatus {
    Pending,
    Consolidated,
    Errored,
}

impl ConsolidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsolidationStatus::Pending => "pending",
            ConsolidationStatus::Consolidated => "consolidated",
            ConsolidationStatus::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConsolidationStatus::Pending),
            "consolidated" => Some(ConsolidationStatus::Consolidated),
            "errored" => Some(ConsolidationStatus::Errored),
            _ => None,
        }
    }
}

/// Per-feed raw table row, keyed `(feed, supplier_stone_id)`.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub feed: String,
    pub supplier_stone_id: String,
    pub offer_id: Option<String>,
    pub payload: serde_json::Value,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub consolidated: bool,
    pub consolidation_status: ConsolidationStatus,
    pub run_id: Uuid,
}

/// `{ "lastUpdatedAt": ISO-8601, "lastRunId": string }`, per-feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(rename = "lastRunId")]
    pub last_run_id: String,
}

// ---------------------------------------------------------------------------
// Transient scanning/partitioning types
// ---------------------------------------------------------------------------

/// A half-open price range paired with its observed record count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityChunk {
    pub min: i64,
    pub max: i64,
    pub count: i64,
}

/// A contiguous price range assigned to exactly one worker stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub partition_id: String,
    pub min_price: i64,
    pub max_price: i64,
    pub total_records: i64,
}

/// Identity extracted from an opaque feed item by `FeedAdapter::extract_identity`.
#[derive(Debug, Clone)]
pub struct ItemIdentity {
    pub supplier_stone_id: String,
    pub offer_id: Option<String>,
    pub payload: serde_json::Value,
    pub source_updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_type_round_trips() {
        for rt in [RunType::Full, RunType::Incremental] {
            assert_eq!(RunType::parse(rt.as_str()), Some(rt));
        }
    }

    #[test]
    fn run_status_round_trips() {
        for rs in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Stalled,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(rs.as_str()), Some(rs));
        }
    }

    #[test]
    fn worker_run_status_round_trips() {
        for s in [
            WorkerRunStatus::Running,
            WorkerRunStatus::Completed,
            WorkerRunStatus::Failed,
        ] {
            assert_eq!(WorkerRunStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unknown_status_parses_to_none() {
        assert_eq!(RunStatus::parse("bogus"), None);
    }
}
