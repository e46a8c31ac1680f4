//! # Core Data Model
//!
//! The entities shared by every component of the control plane: run records,
//! control events, worker heartbeats, per-operation executions, per-second
//! metric snapshots, and FIND_MAX step records.
//!
//! ## Ownership
//!
//! - The **run row** is mutated only by the coordinator.
//! - **Heartbeats** are owned by the emitting worker (single writer per key),
//!   with one carve-out: the coordinator may flip an already-stale row to
//!   DEAD.
//! - **Control events** are append-only, written only by the coordinator,
//!   totally ordered per run by `sequence_id`.
//! - **Query executions**, **metric snapshots**, and **step records** are
//!   append-only streams.
//!
//! All enums persist as SCREAMING_SNAKE_CASE strings so the store stays
//! readable with plain SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::metrics::HardwareMetrics;
use crate::scenario::Scenario;

// ── Run ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Prepared,
    Running,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Prepared => "PREPARED",
            RunStatus::Running => "RUNNING",
            RunStatus::Stopping => "STOPPING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PREPARED" => Some(RunStatus::Prepared),
            "RUNNING" => Some(RunStatus::Running),
            "STOPPING" => Some(RunStatus::Stopping),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase within a RUNNING run. Monotonic: WARMUP → MEASUREMENT → COOLDOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Warmup,
    Measurement,
    Cooldown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Warmup => "WARMUP",
            Phase::Measurement => "MEASUREMENT",
            Phase::Cooldown => "COOLDOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARMUP" => Some(Phase::Warmup),
            "MEASUREMENT" => Some(Phase::Measurement),
            "COOLDOWN" => Some(Phase::Cooldown),
            _ => None,
        }
    }

    /// Compact encoding for atomics shared between worker threads.
    pub fn as_u8(self) -> u8 {
        match self {
            Phase::Warmup => 0,
            Phase::Measurement => 1,
            Phase::Cooldown => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Warmup,
            2 => Phase::Cooldown,
            _ => Phase::Measurement,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized FIND_MAX controller state carried on the run row so a restarted
/// coordinator can resume the step ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindMaxState {
    pub step_number: u32,
    pub current_target: u32,
    pub best_qps: f64,
    pub best_stable_concurrency: Option<u32>,
    pub baseline_p95_ms: Option<f64>,
}

/// The run row. Created at admission, mutated only by the coordinator,
/// finalized to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// Immutable scenario snapshot for the life of the run.
    pub scenario: Scenario,
    pub status: RunStatus,
    pub phase: Phase,
    pub start_time: Option<DateTime<Utc>>,
    pub warmup_end_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_workers_expected: u32,
    pub workers_registered: u32,
    pub workers_active: u32,
    pub workers_completed: u32,
    pub total_ops: u64,
    pub error_count: u64,
    pub current_qps: f64,
    pub find_max_state: Option<FindMaxState>,
    /// Next control-event sequence to issue. Strictly monotonic per run.
    pub next_sequence_id: u64,
    pub reason_code: Option<String>,
    pub reason_message: Option<String>,
    /// One-shot user request flags, set through `Bus::request_stop` and
    /// converted into proper STOP/ABORT control events by the coordinator.
    /// The pending-command channel: never cleared, never overwritten by the
    /// coordinator's own run updates.
    pub stop_requested: bool,
    pub abort_requested: bool,
}

impl RunRecord {
    pub fn new(run_id: Uuid, scenario: Scenario) -> Self {
        let expected = scenario.expected_workers;
        let phase = if scenario.warmup_seconds > 0 {
            Phase::Warmup
        } else {
            Phase::Measurement
        };
        RunRecord {
            run_id,
            scenario,
            status: RunStatus::Prepared,
            phase,
            start_time: None,
            warmup_end_time: None,
            end_time: None,
            total_workers_expected: expected,
            workers_registered: 0,
            workers_active: 0,
            workers_completed: 0,
            total_ops: 0,
            error_count: 0,
            current_qps: 0.0,
            find_max_state: None,
            next_sequence_id: 0,
            reason_code: None,
            reason_message: None,
            stop_requested: false,
            abort_requested: false,
        }
    }
}

// ── Control events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SetPhase,
    SetTargetConcurrency,
    Pause,
    Resume,
    Stop,
    Abort,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SetPhase => "SET_PHASE",
            EventType::SetTargetConcurrency => "SET_TARGET_CONCURRENCY",
            EventType::Pause => "PAUSE",
            EventType::Resume => "RESUME",
            EventType::Stop => "STOP",
            EventType::Abort => "ABORT",
        }
    }
}

/// Typed event payload. Serialized as JSON in the store's `event_data`
/// column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlPayload {
    SetPhase { phase: Phase },
    SetTargetConcurrency { target: u32 },
    Pause,
    Resume,
    Stop,
    Abort,
}

impl ControlPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            ControlPayload::SetPhase { .. } => EventType::SetPhase,
            ControlPayload::SetTargetConcurrency { .. } => EventType::SetTargetConcurrency,
            ControlPayload::Pause => EventType::Pause,
            ControlPayload::Resume => EventType::Resume,
            ControlPayload::Stop => EventType::Stop,
            ControlPayload::Abort => EventType::Abort,
        }
    }
}

/// One entry in the per-run append-only control log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub event_id: Uuid,
    pub run_id: Uuid,
    /// Monotonic per run; the total order across event types.
    pub sequence_id: u64,
    pub payload: ControlPayload,
    pub issued_at: DateTime<Utc>,
}

impl ControlEvent {
    pub fn new(run_id: Uuid, sequence_id: u64, payload: ControlPayload) -> Self {
        ControlEvent {
            event_id: Uuid::new_v4(),
            run_id,
            sequence_id,
            payload,
            issued_at: Utc::now(),
        }
    }
}

// ── Worker heartbeats ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Starting,
    Waiting,
    Running,
    Draining,
    Completed,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Waiting => "WAITING",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Draining => "DRAINING",
            WorkerStatus::Completed => "COMPLETED",
            WorkerStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTING" => Some(WorkerStatus::Starting),
            "WAITING" => Some(WorkerStatus::Waiting),
            "RUNNING" => Some(WorkerStatus::Running),
            "DRAINING" => Some(WorkerStatus::Draining),
            "COMPLETED" => Some(WorkerStatus::Completed),
            "DEAD" => Some(WorkerStatus::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest-state row keyed by `(run_id, worker_id)`. Upserted on every
/// heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub run_id: Uuid,
    pub worker_id: String,
    pub status: WorkerStatus,
    pub phase: Phase,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_count: u64,
    pub active_connections: u32,
    pub target_connections: u32,
    pub queries_processed: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub resources: Option<HardwareMetrics>,
}

// ── Query executions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryKind {
    PointLookup,
    RangeScan,
    Insert,
    Update,
    Delete,
    Custom,
}

impl QueryKind {
    pub const ALL: [QueryKind; 6] = [
        QueryKind::PointLookup,
        QueryKind::RangeScan,
        QueryKind::Insert,
        QueryKind::Update,
        QueryKind::Delete,
        QueryKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::PointLookup => "POINT_LOOKUP",
            QueryKind::RangeScan => "RANGE_SCAN",
            QueryKind::Insert => "INSERT",
            QueryKind::Update => "UPDATE",
            QueryKind::Delete => "DELETE",
            QueryKind::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POINT_LOOKUP" => Some(QueryKind::PointLookup),
            "RANGE_SCAN" => Some(QueryKind::RangeScan),
            "INSERT" => Some(QueryKind::Insert),
            "UPDATE" => Some(QueryKind::Update),
            "DELETE" => Some(QueryKind::Delete),
            "CUSTOM" => Some(QueryKind::Custom),
            _ => None,
        }
    }

    /// Read/write split used by the end-of-run summary. CUSTOM counts as a
    /// write since its statement is opaque.
    pub fn is_read(self) -> bool {
        matches!(self, QueryKind::PointLookup | QueryKind::RangeScan)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transport,
    Cancelled,
    Execution,
    Timeout,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transport => "TRANSPORT",
            ErrorClass::Cancelled => "CANCELLED",
            ErrorClass::Execution => "EXECUTION",
            ErrorClass::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSPORT" => Some(ErrorClass::Transport),
            "CANCELLED" => Some(ErrorClass::Cancelled),
            "EXECUTION" => Some(ErrorClass::Execution),
            "TIMEOUT" => Some(ErrorClass::Timeout),
            _ => None,
        }
    }
}

/// One executed operation. Appended by workers in batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecution {
    pub run_id: Uuid,
    pub worker_id: String,
    pub kind: QueryKind,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: f64,
    pub success: bool,
    /// True iff the phase observed when the operation *started* was WARMUP.
    pub warmup: bool,
    pub rows_returned: Option<u64>,
    pub error_class: Option<ErrorClass>,
}

// ── Metric snapshots ────────────────────────────────────────────

/// Per-worker, per-second metrics. `elapsed_seconds` is the bucket number
/// since run start; cross-worker alignment is by bucket, not timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub run_id: Uuid,
    pub worker_id: String,
    pub elapsed_seconds: u64,
    pub phase: Phase,
    pub active_connections: u32,
    pub target_connections: u32,
    /// Operations completed in this bucket (== QPS at 1 s buckets).
    pub ops: u64,
    pub errors: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub ops_by_kind: BTreeMap<QueryKind, u64>,
    /// Backend-reported queue depth, when the adapter exposes one.
    pub queue_depth: Option<u64>,
}

// ── FIND_MAX step records ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Stable,
    Degraded,
    ErrorThreshold,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Stable => "STABLE",
            StepOutcome::Degraded => "DEGRADED",
            StepOutcome::ErrorThreshold => "ERROR_THRESHOLD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STABLE" => Some(StepOutcome::Stable),
            "DEGRADED" => Some(StepOutcome::Degraded),
            "ERROR_THRESHOLD" => Some(StepOutcome::ErrorThreshold),
            _ => None,
        }
    }
}

/// Written at the close of each FIND_MAX step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub step_number: u32,
    pub target_workers: u32,
    pub qps: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate: f64,
    pub queue_detected: bool,
    pub outcome: StepOutcome,
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_roundtrips_through_text() {
        for s in [
            RunStatus::Prepared,
            RunStatus::Running,
            RunStatus::Stopping,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("BOGUS"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Prepared.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
    }

    #[test]
    fn phase_ordering_is_monotonic() {
        assert!(Phase::Warmup < Phase::Measurement);
        assert!(Phase::Measurement < Phase::Cooldown);
    }

    #[test]
    fn phase_u8_roundtrip() {
        for p in [Phase::Warmup, Phase::Measurement, Phase::Cooldown] {
            assert_eq!(Phase::from_u8(p.as_u8()), p);
        }
    }

    #[test]
    fn query_kind_roundtrips_through_text() {
        for k in QueryKind::ALL {
            assert_eq!(QueryKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn read_write_split() {
        assert!(QueryKind::PointLookup.is_read());
        assert!(QueryKind::RangeScan.is_read());
        assert!(!QueryKind::Insert.is_read());
        assert!(!QueryKind::Update.is_read());
        assert!(!QueryKind::Delete.is_read());
        assert!(!QueryKind::Custom.is_read());
    }

    #[test]
    fn control_payload_maps_to_event_type() {
        let cases = [
            (
                ControlPayload::SetPhase {
                    phase: Phase::Measurement,
                },
                EventType::SetPhase,
            ),
            (
                ControlPayload::SetTargetConcurrency { target: 8 },
                EventType::SetTargetConcurrency,
            ),
            (ControlPayload::Pause, EventType::Pause),
            (ControlPayload::Resume, EventType::Resume),
            (ControlPayload::Stop, EventType::Stop),
            (ControlPayload::Abort, EventType::Abort),
        ];
        for (payload, ty) in cases {
            assert_eq!(payload.event_type(), ty);
        }
    }

    #[test]
    fn control_payload_json_is_tagged() {
        let p = ControlPayload::SetTargetConcurrency { target: 16 };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("SET_TARGET_CONCURRENCY"));
        assert!(json.contains("16"));
        let back: ControlPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn snapshot_kind_map_serializes_with_string_keys() {
        let mut by_kind = BTreeMap::new();
        by_kind.insert(QueryKind::PointLookup, 90u64);
        by_kind.insert(QueryKind::Insert, 10u64);
        let json = serde_json::to_value(&by_kind).unwrap();
        assert_eq!(json["POINT_LOOKUP"], 90);
        assert_eq!(json["INSERT"], 10);
    }

    #[test]
    fn step_outcome_text_roundtrip() {
        for o in [
            StepOutcome::Stable,
            StepOutcome::Degraded,
            StepOutcome::ErrorThreshold,
        ] {
            assert_eq!(StepOutcome::parse(o.as_str()), Some(o));
        }
    }
}
