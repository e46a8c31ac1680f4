//! # MemoryBus — In-Process Coordination
//!
//! Mutex-guarded maps keyed by `run_id`. Used for single-process runs (no
//! `DATABASE_URL` configured) and throughout the test suites, where it lets
//! end-to-end scenarios run without a PostgreSQL instance.
//!
//! A `fail_writes` switch simulates a store outage so worker backoff and the
//! coordinator's `BUS_UNAVAILABLE` path can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::Bus;
use crate::aggregate::RunSummary;
use crate::error::BusError;
use crate::types::{
    ControlEvent, MetricSnapshot, QueryExecution, RunRecord, StepRecord, WorkerHeartbeat,
    WorkerStatus,
};

struct RunState {
    run: RunRecord,
    events: Vec<ControlEvent>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    snapshots: Vec<MetricSnapshot>,
    executions: Vec<QueryExecution>,
    steps: Vec<StepRecord>,
    summary: Option<RunSummary>,
}

impl RunState {
    fn new(run: RunRecord) -> Self {
        RunState {
            run,
            events: Vec::new(),
            heartbeats: HashMap::new(),
            snapshots: Vec::new(),
            executions: Vec::new(),
            steps: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Default)]
pub struct MemoryBus {
    runs: Mutex<HashMap<Uuid, RunState>>,
    fail_writes: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage: every subsequent call fails until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            Err(BusError::Store("memory bus unavailable (injected)".into()))
        } else {
            Ok(())
        }
    }

    fn with_run<T>(
        &self,
        run_id: Uuid,
        f: impl FnOnce(&mut RunState) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        self.check_available()?;
        let mut runs = self.runs.lock().unwrap();
        let state = runs.get_mut(&run_id).ok_or(BusError::RunNotFound(run_id))?;
        f(state)
    }
}

impl Bus for MemoryBus {
    fn create_run(&self, run: &RunRecord) -> Result<(), BusError> {
        self.check_available()?;
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.run_id) {
            return Err(BusError::Store(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        runs.insert(run.run_id, RunState::new(run.clone()));
        Ok(())
    }

    fn update_run(&self, run: &RunRecord) -> Result<(), BusError> {
        self.with_run(run.run_id, |state| {
            // Request flags are one-shot: a racing coordinator update must
            // not clear a flag the user just set.
            let stop = state.run.stop_requested || run.stop_requested;
            let abort = state.run.abort_requested || run.abort_requested;
            state.run = run.clone();
            state.run.stop_requested = stop;
            state.run.abort_requested = abort;
            Ok(())
        })
    }

    fn request_stop(&self, run_id: Uuid, abort: bool) -> Result<(), BusError> {
        self.with_run(run_id, |state| {
            state.run.stop_requested = true;
            if abort {
                state.run.abort_requested = true;
            }
            Ok(())
        })
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, BusError> {
        self.check_available()?;
        let runs = self.runs.lock().unwrap();
        Ok(runs.get(&run_id).map(|s| s.run.clone()))
    }

    fn append_event(&self, event: &ControlEvent) -> Result<(), BusError> {
        self.with_run(event.run_id, |state| {
            if let Some(last) = state.events.last() {
                if event.sequence_id <= last.sequence_id {
                    return Err(BusError::Invariant(format!(
                        "sequence_id regression: {} after {}",
                        event.sequence_id, last.sequence_id
                    )));
                }
            }
            state.events.push(event.clone());
            Ok(())
        })
    }

    fn events_since(&self, run_id: Uuid, after: u64) -> Result<Vec<ControlEvent>, BusError> {
        self.with_run(run_id, |state| {
            Ok(state
                .events
                .iter()
                .filter(|e| e.sequence_id > after)
                .cloned()
                .collect())
        })
    }

    fn upsert_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<(), BusError> {
        self.with_run(hb.run_id, |state| {
            state.heartbeats.insert(hb.worker_id.clone(), hb.clone());
            Ok(())
        })
    }

    fn heartbeats(&self, run_id: Uuid) -> Result<Vec<WorkerHeartbeat>, BusError> {
        self.with_run(run_id, |state| {
            let mut rows: Vec<_> = state.heartbeats.values().cloned().collect();
            rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
            Ok(rows)
        })
    }

    fn mark_worker_dead(&self, run_id: Uuid, worker_id: &str) -> Result<(), BusError> {
        self.with_run(run_id, |state| {
            if let Some(hb) = state.heartbeats.get_mut(worker_id) {
                hb.status = WorkerStatus::Dead;
            }
            Ok(())
        })
    }

    fn append_snapshot(&self, snap: &MetricSnapshot) -> Result<(), BusError> {
        self.with_run(snap.run_id, |state| {
            state.snapshots.push(snap.clone());
            Ok(())
        })
    }

    fn snapshots(&self, run_id: Uuid, since_bucket: u64) -> Result<Vec<MetricSnapshot>, BusError> {
        self.with_run(run_id, |state| {
            Ok(state
                .snapshots
                .iter()
                .filter(|s| s.elapsed_seconds >= since_bucket)
                .cloned()
                .collect())
        })
    }

    fn append_executions(&self, rows: &[QueryExecution]) -> Result<(), BusError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.with_run(rows[0].run_id, |state| {
            state.executions.extend_from_slice(rows);
            Ok(())
        })
    }

    fn executions(&self, run_id: Uuid) -> Result<Vec<QueryExecution>, BusError> {
        self.with_run(run_id, |state| Ok(state.executions.clone()))
    }

    fn execution_count(&self, run_id: Uuid) -> Result<u64, BusError> {
        self.with_run(run_id, |state| Ok(state.executions.len() as u64))
    }

    fn append_step(&self, step: &StepRecord) -> Result<(), BusError> {
        self.with_run(step.run_id, |state| {
            state.steps.push(step.clone());
            Ok(())
        })
    }

    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, BusError> {
        self.with_run(run_id, |state| Ok(state.steps.clone()))
    }

    fn write_summary(&self, run_id: Uuid, summary: &RunSummary) -> Result<(), BusError> {
        self.with_run(run_id, |state| {
            state.summary = Some(summary.clone());
            Ok(())
        })
    }

    fn get_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, BusError> {
        self.with_run(run_id, |state| Ok(state.summary.clone()))
    }
}
