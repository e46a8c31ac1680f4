//! # Heartbeat & Control Bus
//!
//! The only channel between workers and the coordinator. Neither side holds
//! a reference to the other; both address state by `run_id` through this
//! trait. Three logical queues:
//!
//! - **Heartbeats** — keyed store `(run_id, worker_id) → latest`, upserts
//!   only.
//! - **Control events** — per-run append-only log, strictly monotonic
//!   `sequence_id`, consumers poll for values greater than their last
//!   processed one.
//! - **Metrics stream** — per-worker append-only `MetricSnapshot` series
//!   (plus the batched `QueryExecution` and FIND_MAX step streams).
//!
//! Delivery is at-least-once: consumers must treat re-delivered events
//! idempotently. Implementations: [`MemoryBus`] for single-process runs and
//! tests, [`PgBus`] for distributed runs over PostgreSQL.

mod memory;
mod pg;

pub use memory::MemoryBus;
pub use pg::PgBus;

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::aggregate::RunSummary;
use crate::error::BusError;
use crate::types::{
    ControlEvent, MetricSnapshot, QueryExecution, RunRecord, StepRecord, WorkerHeartbeat,
};

/// Default poll cadence for the control-event log.
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default heartbeat upsert cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub trait Bus: Send + Sync {
    // ── Run records (coordinator-owned) ─────────────────────────
    fn create_run(&self, run: &RunRecord) -> Result<(), BusError>;
    fn update_run(&self, run: &RunRecord) -> Result<(), BusError>;
    fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, BusError>;
    /// Set the one-shot stop (or abort) request flag on a run. The
    /// coordinator converts the flag into proper control events; implementers
    /// must never let a coordinator `update_run` clear it.
    fn request_stop(&self, run_id: Uuid, abort: bool) -> Result<(), BusError>;

    // ── Control events (append-only, coordinator writes) ────────
    /// Append one event. Implementations reject a `sequence_id` that is not
    /// strictly greater than the last appended for the run.
    fn append_event(&self, event: &ControlEvent) -> Result<(), BusError>;
    /// Events with `sequence_id > after`, ascending.
    fn events_since(&self, run_id: Uuid, after: u64) -> Result<Vec<ControlEvent>, BusError>;

    // ── Heartbeats (worker-owned, upsert by key) ────────────────
    fn upsert_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<(), BusError>;
    fn heartbeats(&self, run_id: Uuid) -> Result<Vec<WorkerHeartbeat>, BusError>;
    /// Coordinator carve-out: flip a stale worker's status to DEAD in place.
    fn mark_worker_dead(&self, run_id: Uuid, worker_id: &str) -> Result<(), BusError>;

    // ── Metrics stream (append-only) ────────────────────────────
    fn append_snapshot(&self, snap: &MetricSnapshot) -> Result<(), BusError>;
    /// Snapshots with `elapsed_seconds >= since_bucket`, every worker.
    fn snapshots(&self, run_id: Uuid, since_bucket: u64) -> Result<Vec<MetricSnapshot>, BusError>;

    fn append_executions(&self, rows: &[QueryExecution]) -> Result<(), BusError>;
    fn executions(&self, run_id: Uuid) -> Result<Vec<QueryExecution>, BusError>;
    fn execution_count(&self, run_id: Uuid) -> Result<u64, BusError>;

    fn append_step(&self, step: &StepRecord) -> Result<(), BusError>;
    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, BusError>;

    // ── Final aggregates ────────────────────────────────────────
    fn write_summary(&self, run_id: Uuid, summary: &RunSummary) -> Result<(), BusError>;
    fn get_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, BusError>;
}

impl std::fmt::Debug for dyn Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Bus>")
    }
}

/// Retry a transient bus operation with bounded exponential backoff.
///
/// Starts at 100 ms, doubles per attempt, caps at 10 s, and gives up once
/// `grace` has elapsed — returning the last error for the caller to surface.
pub fn retry_with_backoff<T>(
    grace: Duration,
    mut op: impl FnMut() -> Result<T, BusError>,
) -> Result<T, BusError> {
    let started = Instant::now();
    let mut delay = Duration::from_millis(100);
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) => {
                if started.elapsed() + delay > grace {
                    return Err(err);
                }
                tracing::warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "bus operation failed, backing off");
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }
    }
}
