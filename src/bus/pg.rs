//! # PgBus — PostgreSQL-Backed Coordination
//!
//! Bridges the synchronous [`Bus`] trait onto the async [`Database`] store
//! via `tokio::runtime::Handle::block_on`. Worker and coordinator threads
//! are plain OS threads, never tokio tasks, so blocking here cannot
//! deadlock the executor.
//!
//! Any store error surfaces as a transient [`BusError::Store`]; callers
//! apply bounded backoff and the coordinator escalates a sustained outage
//! to run FAILED with reason `BUS_UNAVAILABLE`.

use uuid::Uuid;

use super::Bus;
use crate::aggregate::RunSummary;
use crate::db::Database;
use crate::error::BusError;
use crate::types::{
    ControlEvent, MetricSnapshot, QueryExecution, RunRecord, StepRecord, WorkerHeartbeat,
};

pub struct PgBus {
    db: Database,
    handle: tokio::runtime::Handle,
}

impl PgBus {
    pub fn new(db: Database, handle: tokio::runtime::Handle) -> Self {
        PgBus { db, handle }
    }

    fn run<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, BusError> {
        self.handle
            .block_on(fut)
            .map_err(|e| BusError::Store(e.to_string()))
    }
}

impl Bus for PgBus {
    fn create_run(&self, run: &RunRecord) -> Result<(), BusError> {
        self.run(self.db.insert_run(run))
    }

    fn update_run(&self, run: &RunRecord) -> Result<(), BusError> {
        self.run(self.db.update_run(run))
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, BusError> {
        self.run(self.db.get_run(run_id))
    }

    fn request_stop(&self, run_id: Uuid, abort: bool) -> Result<(), BusError> {
        match self.handle.block_on(self.db.request_stop(run_id, abort)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::RunNotFound(run_id)),
            Err(e) => Err(BusError::Store(e.to_string())),
        }
    }

    fn append_event(&self, event: &ControlEvent) -> Result<(), BusError> {
        self.handle
            .block_on(self.db.append_event(event))
            .map_err(|e| {
                let msg = e.to_string();
                // The (run_id, sequence_id) unique constraint is the store's
                // monotonicity guard; tripping it is a bug, not a transient.
                if msg.contains("duplicate key") {
                    BusError::Invariant(format!("sequence_id not monotonic: {msg}"))
                } else {
                    BusError::Store(msg)
                }
            })
    }

    fn events_since(&self, run_id: Uuid, after: u64) -> Result<Vec<ControlEvent>, BusError> {
        self.run(self.db.events_since(run_id, after))
    }

    fn upsert_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<(), BusError> {
        self.run(self.db.upsert_heartbeat(hb))
    }

    fn heartbeats(&self, run_id: Uuid) -> Result<Vec<WorkerHeartbeat>, BusError> {
        self.run(self.db.heartbeats(run_id))
    }

    fn mark_worker_dead(&self, run_id: Uuid, worker_id: &str) -> Result<(), BusError> {
        self.run(self.db.mark_worker_dead(run_id, worker_id))
    }

    fn append_snapshot(&self, snap: &MetricSnapshot) -> Result<(), BusError> {
        self.run(self.db.append_snapshot(snap))
    }

    fn snapshots(&self, run_id: Uuid, since_bucket: u64) -> Result<Vec<MetricSnapshot>, BusError> {
        self.run(self.db.snapshots(run_id, since_bucket))
    }

    fn append_executions(&self, rows: &[QueryExecution]) -> Result<(), BusError> {
        self.run(self.db.append_executions(rows))
    }

    fn executions(&self, run_id: Uuid) -> Result<Vec<QueryExecution>, BusError> {
        self.run(self.db.executions(run_id))
    }

    fn execution_count(&self, run_id: Uuid) -> Result<u64, BusError> {
        self.run(self.db.execution_count(run_id))
    }

    fn append_step(&self, step: &StepRecord) -> Result<(), BusError> {
        self.run(self.db.append_step(step))
    }

    fn steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, BusError> {
        self.run(self.db.steps(run_id))
    }

    fn write_summary(&self, run_id: Uuid, summary: &RunSummary) -> Result<(), BusError> {
        self.run(self.db.write_summary(run_id, summary))
    }

    fn get_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, BusError> {
        self.run(self.db.get_summary(run_id))
    }
}
