//! # Worker — Concurrent Query Executor Pool
//!
//! A worker drives operations against exactly one target. Inside it, an
//! ordered pool of N executor threads each owns one connection and blocks on
//! one adapter call at a time, so parallelism is exactly
//! `target_connections`. Three coordination threads ride alongside:
//!
//! ```text
//! control thread  → polls the bus (500 ms), applies events in sequence order
//! reporter thread → 1 s drift-corrected: MetricSnapshot + heartbeat + batch flush
//! supervisor      → reconciles executor count with the target, reaps drained
//! ```
//!
//! ## Concurrency changes
//!
//! Raising the target spawns executors that join the pool and begin
//! immediately. Lowering marks the highest-indexed executors DRAINING: each
//! finishes its in-flight operation, releases its connection, and exits —
//! no new operation ever starts on a draining executor.
//!
//! ## Phase tagging
//!
//! Every execution is tagged `warmup` from the phase observed when the
//! operation *started*; in-flight operations complete under their starting
//! phase.
//!
//! ## Shutdown
//!
//! STOP drains: executors finish their current operation, bounded by
//! `stop_grace`. ABORT fires adapter cancel handles, then closes whatever
//! remains after `abort_grace`; interrupted operations surface as
//! `error_class=CANCELLED`.

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::adapter::{CancelHandle, Operation, TargetAdapter};
use crate::bus::{retry_with_backoff, Bus};
use crate::error::BusError;
use crate::metrics;
use crate::scenario::{MixMode, Scenario};
use crate::stats::percentile_sorted;
use crate::types::{
    ControlPayload, MetricSnapshot, Phase, QueryExecution, QueryKind, RunStatus, WorkerHeartbeat,
    WorkerStatus,
};
use crate::value_pool::ValuePool;

/// Worker-side timing knobs. Tests compress these to run scenarios in
/// hundreds of milliseconds.
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    pub control_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stop_grace: Duration,
    pub abort_grace: Duration,
    /// Coordinator-side staleness bound; a heartbeat write blocking past
    /// half of it is logged as a warning (not fatal).
    pub liveness_timeout: Duration,
    /// How long to keep retrying a failing bus before giving up.
    pub bus_failure_grace: Duration,
    /// Flush the execution batch early once it reaches this size.
    pub execution_batch_max: usize,
    /// Attach hardware readings to heartbeats.
    pub collect_hardware: bool,
    /// Consecutive over-threshold intervals before reporting DRAINING.
    pub sustained_error_intervals: u32,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        WorkerTuning {
            control_poll_interval: crate::bus::CONTROL_POLL_INTERVAL,
            heartbeat_interval: crate::bus::HEARTBEAT_INTERVAL,
            stop_grace: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(10),
            bus_failure_grace: Duration::from_secs(30),
            execution_batch_max: 5_000,
            collect_hardware: true,
            sustained_error_intervals: 3,
        }
    }
}

/// Final worker accounting, returned when the worker exits.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub queries_processed: u64,
    pub error_count: u64,
}

/// How an operation's mix kind is drawn.
enum MixSchedule {
    /// Independent Bernoulli draw per operation.
    Independent { weights: Vec<(QueryKind, u32)> },
    /// Permuted 100-slot block hitting the percentages exactly.
    Exact {
        block: Vec<QueryKind>,
        cursor: AtomicUsize,
    },
}

impl MixSchedule {
    fn from_scenario(scenario: &Scenario) -> MixSchedule {
        let weights: Vec<(QueryKind, u32)> = scenario
            .mix
            .iter()
            .filter(|(_, pct)| **pct > 0)
            .map(|(k, pct)| (*k, *pct))
            .collect();
        match scenario.mix_mode {
            MixMode::Independent => MixSchedule::Independent { weights },
            MixMode::Exact => {
                let mut block = Vec::with_capacity(100);
                for (kind, pct) in &weights {
                    block.extend(std::iter::repeat(*kind).take(*pct as usize));
                }
                block.shuffle(&mut rand::thread_rng());
                MixSchedule::Exact {
                    block,
                    cursor: AtomicUsize::new(0),
                }
            }
        }
    }

    fn draw(&self) -> QueryKind {
        match self {
            MixSchedule::Independent { weights } => {
                let roll = rand::thread_rng().gen_range(0..100u32);
                let mut acc = 0;
                for (kind, pct) in weights {
                    acc += pct;
                    if roll < acc {
                        return *kind;
                    }
                }
                // Weights sum to 100 at admission; last kind absorbs rounding.
                weights.last().map(|(k, _)| *k).unwrap_or(QueryKind::Custom)
            }
            MixSchedule::Exact { block, cursor } => {
                let i = cursor.fetch_add(1, Ordering::Relaxed) % block.len();
                block[i]
            }
        }
    }
}

/// Per-interval sample sink, drained by the reporter once a second.
#[derive(Default)]
struct IntervalSink {
    latencies: Vec<f64>,
    ops_by_kind: BTreeMap<QueryKind, u64>,
    errors: u64,
    queue_depth: Option<u64>,
    executions: Vec<QueryExecution>,
}

/// State shared between the executor, control, reporter, and supervisor
/// threads.
pub struct WorkerShared {
    phase: AtomicU8,
    target: AtomicU32,
    paused: AtomicBool,
    stop: AtomicBool,
    abort: AtomicBool,
    /// Sustained error rate or fatal open failures: report DRAINING.
    overloaded: AtomicBool,
    active_executors: AtomicU32,
    queries_processed: AtomicU64,
    error_count: AtomicU64,
    last_applied_sequence: AtomicU64,
    last_error: Mutex<Option<String>>,
    sink: Mutex<IntervalSink>,
    cancel_handles: Mutex<HashMap<usize, Arc<dyn CancelHandle>>>,
}

impl WorkerShared {
    pub fn new(initial_target: u32, initial_phase: Phase) -> Arc<Self> {
        Arc::new(WorkerShared {
            phase: AtomicU8::new(initial_phase.as_u8()),
            target: AtomicU32::new(initial_target),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            overloaded: AtomicBool::new(false),
            active_executors: AtomicU32::new(0),
            queries_processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_applied_sequence: AtomicU64::new(0),
            last_error: Mutex::new(None),
            sink: Mutex::new(IntervalSink::default()),
            cancel_handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Relaxed)
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied_sequence.load(Ordering::Relaxed)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.abort.load(Ordering::Relaxed)
    }

    fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(message.into());
    }

    /// Apply one control event. Idempotent: re-applying the latest event of
    /// any type resolves to the same state, and events at or below the last
    /// applied sequence are skipped entirely.
    pub fn apply_event(&self, sequence_id: u64, payload: &ControlPayload) {
        if sequence_id <= self.last_applied_sequence.load(Ordering::Relaxed) {
            return;
        }
        match payload {
            ControlPayload::SetPhase { phase } => {
                self.phase.store(phase.as_u8(), Ordering::Relaxed);
            }
            ControlPayload::SetTargetConcurrency { target } => {
                self.target.store(*target, Ordering::Relaxed);
            }
            ControlPayload::Pause => self.paused.store(true, Ordering::Relaxed),
            ControlPayload::Resume => self.paused.store(false, Ordering::Relaxed),
            ControlPayload::Stop => self.stop.store(true, Ordering::Relaxed),
            ControlPayload::Abort => {
                self.abort.store(true, Ordering::Relaxed);
                for handle in self.cancel_handles.lock().unwrap().values() {
                    handle.cancel();
                }
            }
        }
        self.last_applied_sequence
            .store(sequence_id, Ordering::Relaxed);
    }

    /// Record a completed operation. Returns the pending execution batch
    /// when it crossed `batch_max`, for the caller to flush ahead of the
    /// next reporter tick.
    fn record_result(
        &self,
        execution: QueryExecution,
        queue_depth: Option<u64>,
        batch_max: usize,
    ) -> Option<Vec<QueryExecution>> {
        self.queries_processed.fetch_add(1, Ordering::Relaxed);
        if !execution.success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            if let Some(msg) = &execution.error_class {
                self.set_last_error(format!("{}: operation failed", msg.as_str()));
            }
        }
        let mut sink = self.sink.lock().unwrap();
        sink.latencies.push(execution.elapsed_ms);
        *sink.ops_by_kind.entry(execution.kind).or_insert(0) += 1;
        if !execution.success {
            sink.errors += 1;
        }
        if let Some(q) = queue_depth {
            let entry = sink.queue_depth.get_or_insert(0);
            *entry = (*entry).max(q);
        }
        sink.executions.push(execution);
        (sink.executions.len() >= batch_max).then(|| std::mem::take(&mut sink.executions))
    }

    /// Return an unflushed batch to the sink after a failed write.
    fn requeue_executions(&self, batch: Vec<QueryExecution>) {
        self.sink.lock().unwrap().executions.extend(batch);
    }
}

pub struct WorkerConfig {
    pub run_id: Uuid,
    pub worker_id: String,
    pub scenario: Scenario,
    pub tuning: WorkerTuning,
}

pub struct Worker {
    cfg: WorkerConfig,
    bus: Arc<dyn Bus>,
    adapter: Arc<dyn TargetAdapter>,
    pool: Arc<ValuePool>,
    mix: Arc<MixSchedule>,
}

impl Worker {
    pub fn new(bus: Arc<dyn Bus>, adapter: Arc<dyn TargetAdapter>, cfg: WorkerConfig) -> Self {
        let pool = Arc::new(ValuePool::from_scenario(&cfg.scenario));
        let mix = Arc::new(MixSchedule::from_scenario(&cfg.scenario));
        Worker {
            cfg,
            bus,
            adapter,
            pool,
            mix,
        }
    }

    /// Run the worker to completion. Blocks the calling thread until the
    /// run stops, aborts, or the bus is lost for longer than
    /// `bus_failure_grace`.
    pub fn run(&self) -> Result<WorkerOutcome, BusError> {
        let scenario = &self.cfg.scenario;
        let initial_phase = if scenario.warmup_seconds > 0 {
            Phase::Warmup
        } else {
            Phase::Measurement
        };
        let shared = WorkerShared::new(scenario.load.initial_target(), initial_phase);
        let heartbeat_seq = Arc::new(AtomicU64::new(0));

        // Registration: the STARTING heartbeat.
        self.send_heartbeat(&shared, &heartbeat_seq, WorkerStatus::Starting, None)?;
        tracing::info!(run_id = %self.cfg.run_id, worker_id = %self.cfg.worker_id, "worker registered");

        // Wait for the coordinator to move the run to RUNNING.
        self.await_run_start(&shared, &heartbeat_seq)?;
        let run_epoch = Instant::now();

        let control = self.spawn_control_thread(Arc::clone(&shared));
        let reporter = self.spawn_reporter_thread(Arc::clone(&shared), run_epoch, Arc::clone(&heartbeat_seq));

        self.supervise_executors(&shared);

        // Drain complete; stop the side threads and flush what remains.
        let _ = control.join();
        let _ = reporter.join();
        self.flush_sink(&shared, run_epoch, true);

        let outcome = WorkerOutcome {
            queries_processed: shared.queries_processed.load(Ordering::Relaxed),
            error_count: shared.error_count.load(Ordering::Relaxed),
        };
        self.send_heartbeat(&shared, &heartbeat_seq, WorkerStatus::Completed, None)?;
        tracing::info!(
            run_id = %self.cfg.run_id,
            worker_id = %self.cfg.worker_id,
            queries = outcome.queries_processed,
            errors = outcome.error_count,
            "worker completed"
        );
        Ok(outcome)
    }

    fn await_run_start(
        &self,
        shared: &Arc<WorkerShared>,
        heartbeat_seq: &Arc<AtomicU64>,
    ) -> Result<(), BusError> {
        let mut last_heartbeat = Instant::now();
        loop {
            let run = retry_with_backoff(self.cfg.tuning.bus_failure_grace, || {
                self.bus.get_run(self.cfg.run_id)
            })?
            .ok_or(BusError::RunNotFound(self.cfg.run_id))?;
            match run.status {
                RunStatus::Running => return Ok(()),
                s if s.is_terminal() => {
                    // Run failed admission-side before starting; nothing to do.
                    shared.stop.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                _ => {}
            }
            if last_heartbeat.elapsed() >= self.cfg.tuning.heartbeat_interval {
                self.send_heartbeat(shared, heartbeat_seq, WorkerStatus::Waiting, None)?;
                last_heartbeat = Instant::now();
            }
            thread::sleep(self.cfg.tuning.control_poll_interval.min(Duration::from_millis(100)));
        }
    }

    fn spawn_control_thread(&self, shared: Arc<WorkerShared>) -> thread::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let run_id = self.cfg.run_id;
        let poll = self.cfg.tuning.control_poll_interval;
        thread::spawn(move || {
            while !(shared.stopping() && shared.active_executors.load(Ordering::Relaxed) == 0) {
                let after = shared.last_applied_sequence.load(Ordering::Relaxed);
                match bus.events_since(run_id, after) {
                    Ok(events) => {
                        for event in events {
                            shared.apply_event(event.sequence_id, &event.payload);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "control poll failed");
                    }
                }
                thread::sleep(poll);
            }
        })
    }

    fn spawn_reporter_thread(
        &self,
        shared: Arc<WorkerShared>,
        run_epoch: Instant,
        heartbeat_seq: Arc<AtomicU64>,
    ) -> thread::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let run_id = self.cfg.run_id;
        let worker_id = self.cfg.worker_id.clone();
        let tuning = self.cfg.tuning.clone();
        let error_rate_threshold = self.cfg.scenario.error_rate_threshold;
        thread::spawn(move || {
            let mut sys = tuning.collect_hardware.then(sysinfo::System::new);
            let mut bucket: u64 = 0;
            let mut over_threshold_intervals: u32 = 0;
            loop {
                // Drift-corrected tick: sleep to the absolute boundary.
                let next = run_epoch + tuning.heartbeat_interval * (bucket as u32 + 1);
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                }

                let done = shared.stopping() && shared.active_executors.load(Ordering::Relaxed) == 0;

                // Snapshot of the just-completed interval.
                let (snapshot, interval_error_rate) =
                    build_snapshot(&shared, run_id, &worker_id, bucket);
                if let Err(err) = bus.append_snapshot(&snapshot) {
                    tracing::warn!(error = %err, "snapshot append failed");
                }
                let sink_batch = {
                    let mut sink = shared.sink.lock().unwrap();
                    std::mem::take(&mut sink.executions)
                };
                if !sink_batch.is_empty() {
                    if let Err(err) = retry_with_backoff(tuning.bus_failure_grace, || {
                        bus.append_executions(&sink_batch)
                    }) {
                        tracing::warn!(error = %err, dropped = sink_batch.len(), "execution flush failed");
                    }
                }

                // Sustained error rate → report DRAINING; coordinator decides.
                if interval_error_rate > error_rate_threshold {
                    over_threshold_intervals += 1;
                    if over_threshold_intervals >= tuning.sustained_error_intervals {
                        shared.overloaded.store(true, Ordering::Relaxed);
                    }
                } else {
                    over_threshold_intervals = 0;
                }

                let status = if done {
                    WorkerStatus::Completed
                } else if shared.stopping() || shared.overloaded.load(Ordering::Relaxed) {
                    WorkerStatus::Draining
                } else {
                    WorkerStatus::Running
                };
                let resources = sys.as_mut().map(|s| {
                    s.refresh_cpu_all();
                    s.refresh_memory();
                    metrics::collect(s)
                });
                let hb = heartbeat_row(
                    &shared,
                    run_id,
                    &worker_id,
                    status,
                    &heartbeat_seq,
                    resources,
                );
                let upsert_started = Instant::now();
                if let Err(err) = bus.upsert_heartbeat(&hb) {
                    tracing::warn!(error = %err, "heartbeat upsert failed");
                }
                // A slow bus write risks the coordinator seeing us as stale.
                if upsert_started.elapsed() > tuning.liveness_timeout / 2 {
                    tracing::warn!(
                        blocked_ms = upsert_started.elapsed().as_millis() as u64,
                        "heartbeat upsert blocked past half the liveness timeout"
                    );
                }

                bucket += 1;
                if done {
                    break;
                }
            }
        })
    }

    /// Reconcile the executor pool with the shared target until stopped and
    /// fully drained.
    fn supervise_executors(&self, shared: &Arc<WorkerShared>) {
        let mut executors: Vec<Option<ExecutorSlot>> = Vec::new();
        let reconcile_interval = Duration::from_millis(20);

        loop {
            // Reap finished threads.
            for slot in executors.iter_mut() {
                let finished = slot
                    .as_ref()
                    .map(|s| s.handle.is_finished())
                    .unwrap_or(false);
                if finished {
                    if let Some(s) = slot.take() {
                        let _ = s.handle.join();
                    }
                }
            }

            if shared.stopping() {
                // Drain everything: signal and wait below.
                for slot in executors.iter().flatten() {
                    slot.ctl.draining.store(true, Ordering::Relaxed);
                }
                break;
            }

            let target = if shared.paused.load(Ordering::Relaxed) {
                // Paused executors idle in place; the pool holds steady.
                executors.iter().flatten().count() as u32
            } else {
                shared.target.load(Ordering::Relaxed)
            };
            let live: Vec<usize> = executors
                .iter()
                .enumerate()
                .filter_map(|(i, s)| {
                    s.as_ref()
                        .filter(|s| !s.ctl.draining.load(Ordering::Relaxed))
                        .map(|_| i)
                })
                .collect();

            if (live.len() as u32) < target {
                // Raise: fill empty slots first, then extend the pool.
                let mut needed = target - live.len() as u32;
                let mut index = 0;
                while needed > 0 {
                    if index == executors.len() {
                        executors.push(None);
                    }
                    if executors[index].is_none() {
                        executors[index] = Some(self.spawn_executor(Arc::clone(shared), index));
                        needed -= 1;
                    }
                    index += 1;
                }
            } else if (live.len() as u32) > target {
                // Lower: drain the highest-indexed executors.
                let excess = live.len() - target as usize;
                for &i in live.iter().rev().take(excess) {
                    if let Some(slot) = &executors[i] {
                        slot.ctl.draining.store(true, Ordering::Relaxed);
                    }
                }
            }

            thread::sleep(reconcile_interval);
        }

        // Bounded drain.
        let grace = if shared.abort.load(Ordering::Relaxed) {
            self.cfg.tuning.abort_grace
        } else {
            self.cfg.tuning.stop_grace
        };
        let deadline = Instant::now() + grace;
        for slot in executors.into_iter().flatten() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(worker_id = %self.cfg.worker_id, "drain grace exhausted, leaving executor behind");
                continue;
            }
            if !join_with_timeout(slot.handle, remaining) {
                tracing::warn!(worker_id = %self.cfg.worker_id, "executor did not drain within grace");
            }
        }
    }

    fn spawn_executor(&self, shared: Arc<WorkerShared>, index: usize) -> ExecutorSlot {
        let ctl = Arc::new(ExecutorCtl {
            draining: AtomicBool::new(false),
        });
        let ctx = ExecutorCtx {
            shared,
            ctl: Arc::clone(&ctl),
            bus: Arc::clone(&self.bus),
            adapter: Arc::clone(&self.adapter),
            pool: Arc::clone(&self.pool),
            scenario: self.cfg.scenario.clone(),
            mix: Arc::clone(&self.mix),
            run_id: self.cfg.run_id,
            worker_id: self.cfg.worker_id.clone(),
            index,
            batch_max: self.cfg.tuning.execution_batch_max,
        };
        let handle = thread::spawn(move || executor_main(ctx));
        ExecutorSlot { ctl, handle }
    }

    fn flush_sink(&self, shared: &Arc<WorkerShared>, run_epoch: Instant, final_flush: bool) {
        let batch = {
            let mut sink = shared.sink.lock().unwrap();
            std::mem::take(&mut sink.executions)
        };
        if !batch.is_empty() {
            let _ = retry_with_backoff(self.cfg.tuning.bus_failure_grace, || {
                self.bus.append_executions(&batch)
            });
        }
        if final_flush {
            let interval = self.cfg.tuning.heartbeat_interval.as_secs_f64();
            let bucket = (run_epoch.elapsed().as_secs_f64() / interval.max(f64::EPSILON)) as u64;
            let (snapshot, _) = build_snapshot(shared, self.cfg.run_id, &self.cfg.worker_id, bucket);
            if snapshot.ops > 0 {
                let _ = self.bus.append_snapshot(&snapshot);
            }
        }
    }

    fn send_heartbeat(
        &self,
        shared: &Arc<WorkerShared>,
        heartbeat_seq: &Arc<AtomicU64>,
        status: WorkerStatus,
        resources: Option<metrics::HardwareMetrics>,
    ) -> Result<(), BusError> {
        let hb = heartbeat_row(
            shared,
            self.cfg.run_id,
            &self.cfg.worker_id,
            status,
            heartbeat_seq,
            resources,
        );
        retry_with_backoff(self.cfg.tuning.bus_failure_grace, || {
            self.bus.upsert_heartbeat(&hb)
        })
    }
}

struct ExecutorCtl {
    draining: AtomicBool,
}

struct ExecutorSlot {
    ctl: Arc<ExecutorCtl>,
    handle: thread::JoinHandle<()>,
}

struct ExecutorCtx {
    shared: Arc<WorkerShared>,
    ctl: Arc<ExecutorCtl>,
    bus: Arc<dyn Bus>,
    adapter: Arc<dyn TargetAdapter>,
    pool: Arc<ValuePool>,
    scenario: Scenario,
    mix: Arc<MixSchedule>,
    run_id: Uuid,
    worker_id: String,
    index: usize,
    batch_max: usize,
}

/// Consecutive connection-open failures before the executor gives up and
/// the worker reports DRAINING.
const MAX_OPEN_FAILURES: u32 = 3;

fn executor_main(ctx: ExecutorCtx) {
    let mut open_failures = 0u32;
    let mut conn = loop {
        if ctx.shared.stopping() || ctx.ctl.draining.load(Ordering::Relaxed) {
            return;
        }
        match ctx.adapter.open(&ctx.scenario.target) {
            Ok(conn) => break conn,
            Err(err) => {
                open_failures += 1;
                ctx.shared.set_last_error(format!("{}: {err}", err.class()));
                tracing::warn!(executor = ctx.index, error = %err, "connection open failed");
                if open_failures >= MAX_OPEN_FAILURES {
                    ctx.shared.overloaded.store(true, Ordering::Relaxed);
                    return;
                }
                thread::sleep(Duration::from_millis(200 << open_failures));
            }
        }
    };

    ctx.shared.active_executors.fetch_add(1, Ordering::Relaxed);
    if let Some(handle) = conn.cancel_handle() {
        ctx.shared
            .cancel_handles
            .lock()
            .unwrap()
            .insert(ctx.index, handle);
    }

    loop {
        if ctx.shared.stopping() || ctx.ctl.draining.load(Ordering::Relaxed) {
            break;
        }
        if ctx.shared.paused.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        // Reopen a connection the target killed.
        if conn.is_dead() {
            conn.close();
            match ctx.adapter.open(&ctx.scenario.target) {
                Ok(fresh) => {
                    conn = fresh;
                    if let Some(handle) = conn.cancel_handle() {
                        ctx.shared
                            .cancel_handles
                            .lock()
                            .unwrap()
                            .insert(ctx.index, handle);
                    }
                }
                Err(err) => {
                    open_failures += 1;
                    ctx.shared.set_last_error(format!("{}: {err}", err.class()));
                    if open_failures >= MAX_OPEN_FAILURES {
                        ctx.shared.overloaded.store(true, Ordering::Relaxed);
                        break;
                    }
                    thread::sleep(Duration::from_millis(200 << open_failures));
                    continue;
                }
            }
        }

        let kind = ctx.mix.draw();
        let spec = match ctx.scenario.operations.get(&kind) {
            Some(spec) => spec,
            None => continue,
        };
        let operation = Operation {
            kind,
            sql_template: spec.sql_template.clone(),
            binds: ctx.pool.next(kind),
            expects_rows: spec.expects_rows.unwrap_or(kind.is_read()),
        };

        // Phase is read once, when the operation starts.
        let start_time = Utc::now();
        let phase_at_start = ctx.shared.phase();
        let result = conn.execute(&operation);
        let queue_depth = conn.server_timings().and_then(|t| t.queue_depth);

        let overflow = ctx.shared.record_result(
            QueryExecution {
                run_id: ctx.run_id,
                worker_id: ctx.worker_id.clone(),
                kind,
                start_time,
                elapsed_ms: result.elapsed_ms,
                success: result.success,
                warmup: phase_at_start == Phase::Warmup,
                rows_returned: result.rows_returned,
                error_class: result.error_class,
            },
            queue_depth,
            ctx.batch_max,
        );
        if let Some(batch) = overflow {
            // The batch cap fired ahead of the reporter tick.
            if let Err(err) = ctx.bus.append_executions(&batch) {
                tracing::warn!(error = %err, "overflow execution flush failed, requeueing");
                ctx.shared.requeue_executions(batch);
            }
        }
        if let Some(msg) = result.error_message {
            ctx.shared.set_last_error(msg);
        }
    }

    ctx.shared.cancel_handles.lock().unwrap().remove(&ctx.index);
    conn.close();
    ctx.shared.active_executors.fetch_sub(1, Ordering::Relaxed);
}

fn build_snapshot(
    shared: &Arc<WorkerShared>,
    run_id: Uuid,
    worker_id: &str,
    bucket: u64,
) -> (MetricSnapshot, f64) {
    let (mut latencies, ops_by_kind, errors, queue_depth) = {
        let mut sink = shared.sink.lock().unwrap();
        (
            std::mem::take(&mut sink.latencies),
            std::mem::take(&mut sink.ops_by_kind),
            std::mem::replace(&mut sink.errors, 0),
            sink.queue_depth.take(),
        )
    };
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let ops = latencies.len() as u64;
    let error_rate = if ops > 0 { errors as f64 / ops as f64 } else { 0.0 };
    let snapshot = MetricSnapshot {
        run_id,
        worker_id: worker_id.to_string(),
        elapsed_seconds: bucket,
        phase: shared.phase(),
        active_connections: shared.active_executors.load(Ordering::Relaxed),
        target_connections: shared.target.load(Ordering::Relaxed),
        ops,
        errors,
        p50_ms: percentile_sorted(&latencies, 50.0),
        p95_ms: percentile_sorted(&latencies, 95.0),
        p99_ms: percentile_sorted(&latencies, 99.0),
        ops_by_kind,
        queue_depth,
    };
    (snapshot, error_rate)
}

fn heartbeat_row(
    shared: &Arc<WorkerShared>,
    run_id: Uuid,
    worker_id: &str,
    status: WorkerStatus,
    heartbeat_seq: &Arc<AtomicU64>,
    resources: Option<metrics::HardwareMetrics>,
) -> WorkerHeartbeat {
    WorkerHeartbeat {
        run_id,
        worker_id: worker_id.to_string(),
        status,
        phase: shared.phase(),
        last_heartbeat: Utc::now(),
        heartbeat_count: heartbeat_seq.fetch_add(1, Ordering::Relaxed) + 1,
        active_connections: shared.active_executors.load(Ordering::Relaxed),
        target_connections: shared.target.load(Ordering::Relaxed),
        queries_processed: shared.queries_processed.load(Ordering::Relaxed),
        error_count: shared.error_count.load(Ordering::Relaxed),
        last_error: shared.last_error.lock().unwrap().clone(),
        resources,
    }
}

/// Join a thread, giving up after `timeout`. Returns false if the thread is
/// still running (it is left detached).
fn join_with_timeout(handle: thread::JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::types::{ControlEvent, RunRecord};

    fn scenario_json(latency_ms: u64, concurrency: u32) -> String {
        format!(
            r#"{{
                "template_id": "worker-test",
                "target": {{"adapter": "mock", "params": {{"latency_ms": {latency_ms}}}}},
                "table": "t",
                "duration_seconds": 10,
                "load_mode": "FIXED_CONCURRENCY",
                "target_concurrency": {concurrency},
                "mix": {{"POINT_LOOKUP": 100}},
                "operations": {{
                    "POINT_LOOKUP": {{"sql_template": "SELECT * FROM t WHERE id = $1",
                                      "bind_source": {{"sequence": {{"start": 1}}}}}}
                }}
            }}"#
        )
    }

    fn fast_tuning() -> WorkerTuning {
        WorkerTuning {
            control_poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(5),
            abort_grace: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(1),
            bus_failure_grace: Duration::from_secs(2),
            execution_batch_max: 1_000,
            collect_hardware: false,
            sustained_error_intervals: 3,
        }
    }

    struct Harness {
        bus: Arc<MemoryBus>,
        run_id: Uuid,
        next_seq: u64,
    }

    impl Harness {
        fn start(scenario_json: &str) -> Self {
            let bus = Arc::new(MemoryBus::new());
            let run_id = Uuid::new_v4();
            let scenario = Scenario::from_json(scenario_json).unwrap();
            let mut run = RunRecord::new(run_id, scenario);
            run.status = RunStatus::Running;
            run.start_time = Some(Utc::now());
            bus.create_run(&run).unwrap();
            Harness {
                bus,
                run_id,
                next_seq: 0,
            }
        }

        fn send(&mut self, payload: ControlPayload) {
            self.next_seq += 1;
            self.bus
                .append_event(&ControlEvent::new(self.run_id, self.next_seq, payload))
                .unwrap();
        }

        fn spawn_worker(&self, scenario_json: &str) -> thread::JoinHandle<WorkerOutcome> {
            let worker = Worker::new(
                Arc::clone(&self.bus) as Arc<dyn Bus>,
                crate::adapter::create("mock").unwrap(),
                WorkerConfig {
                    run_id: self.run_id,
                    worker_id: "w1".into(),
                    scenario: Scenario::from_json(scenario_json).unwrap(),
                    tuning: fast_tuning(),
                },
            );
            thread::spawn(move || worker.run().unwrap())
        }
    }

    // ── Event application (idempotence, properties 6 & 7) ─────────

    #[test]
    fn reapplying_latest_target_event_is_idempotent() {
        let shared = WorkerShared::new(2, Phase::Measurement);
        shared.apply_event(1, &ControlPayload::SetTargetConcurrency { target: 8 });
        assert_eq!(shared.target(), 8);
        // At-least-once delivery: the same event arrives again.
        shared.apply_event(1, &ControlPayload::SetTargetConcurrency { target: 8 });
        assert_eq!(shared.target(), 8);
        assert_eq!(shared.last_applied_sequence(), 1);
    }

    #[test]
    fn stale_events_are_skipped() {
        let shared = WorkerShared::new(2, Phase::Measurement);
        shared.apply_event(5, &ControlPayload::SetTargetConcurrency { target: 16 });
        shared.apply_event(3, &ControlPayload::SetTargetConcurrency { target: 4 });
        assert_eq!(shared.target(), 16, "older event must not supersede newer");
    }

    #[test]
    fn stop_twice_is_a_noop() {
        let shared = WorkerShared::new(2, Phase::Measurement);
        shared.apply_event(1, &ControlPayload::Stop);
        assert!(shared.stopping());
        shared.apply_event(2, &ControlPayload::Stop);
        assert!(shared.stopping());
        assert_eq!(shared.last_applied_sequence(), 2);
    }

    #[test]
    fn events_apply_in_sequence_order() {
        let shared = WorkerShared::new(2, Phase::Warmup);
        shared.apply_event(1, &ControlPayload::SetPhase { phase: Phase::Measurement });
        shared.apply_event(2, &ControlPayload::SetTargetConcurrency { target: 6 });
        shared.apply_event(3, &ControlPayload::SetPhase { phase: Phase::Cooldown });
        assert_eq!(shared.phase(), Phase::Cooldown);
        assert_eq!(shared.target(), 6);
    }

    #[test]
    fn replaying_full_log_reaches_the_same_state() {
        // Crash-recovery model: a fresh consumer replaying the log from zero
        // lands on the same targets.
        let log = [
            (1, ControlPayload::SetPhase { phase: Phase::Measurement }),
            (2, ControlPayload::SetTargetConcurrency { target: 4 }),
            (3, ControlPayload::SetTargetConcurrency { target: 12 }),
            (4, ControlPayload::Pause),
            (5, ControlPayload::Resume),
        ];
        let a = WorkerShared::new(1, Phase::Warmup);
        let b = WorkerShared::new(1, Phase::Warmup);
        for (seq, payload) in &log {
            a.apply_event(*seq, payload);
        }
        // Replay twice on the second consumer.
        for _ in 0..2 {
            for (seq, payload) in &log {
                b.apply_event(*seq, payload);
            }
        }
        assert_eq!(a.target(), b.target());
        assert_eq!(a.phase(), b.phase());
        assert_eq!(a.last_applied_sequence(), b.last_applied_sequence());
    }

    // ── Mix schedules ─────────────────────────────────────────────

    #[test]
    fn independent_mix_respects_weights_within_tolerance() {
        let scenario = Scenario::from_json(
            &scenario_json(1, 1).replace(
                r#""mix": {"POINT_LOOKUP": 100}"#,
                r#""mix": {"POINT_LOOKUP": 50, "INSERT": 50}"#,
            )
            .replace(
                r#""operations": {"#,
                r#""operations": {
                    "INSERT": {"sql_template": "INSERT INTO t VALUES ($1)"},"#,
            ),
        )
        .unwrap();
        let mix = MixSchedule::from_scenario(&scenario);
        let mut lookups = 0u32;
        let draws = 10_000;
        for _ in 0..draws {
            if mix.draw() == QueryKind::PointLookup {
                lookups += 1;
            }
        }
        let fraction = lookups as f64 / draws as f64;
        assert!(
            (0.45..=0.55).contains(&fraction),
            "50/50 mix drifted to {fraction}"
        );
    }

    #[test]
    fn zero_weight_kinds_never_run() {
        let scenario = Scenario::from_json(
            &scenario_json(1, 1).replace(
                r#""mix": {"POINT_LOOKUP": 100}"#,
                r#""mix": {"POINT_LOOKUP": 100, "DELETE": 0}"#,
            ),
        )
        .unwrap();
        let mix = MixSchedule::from_scenario(&scenario);
        for _ in 0..1_000 {
            assert_ne!(mix.draw(), QueryKind::Delete);
        }
    }

    #[test]
    fn exact_mix_hits_quota_every_hundred_draws() {
        let scenario = Scenario::from_json(
            &scenario_json(1, 1)
                .replace(
                    r#""mix": {"POINT_LOOKUP": 100}"#,
                    r#""mix": {"POINT_LOOKUP": 70, "INSERT": 30}, "mix_mode": "exact""#,
                )
                .replace(
                    r#""operations": {"#,
                    r#""operations": {
                        "INSERT": {"sql_template": "INSERT INTO t VALUES ($1)"},"#,
                ),
        )
        .unwrap();
        let mix = MixSchedule::from_scenario(&scenario);
        for _ in 0..3 {
            let mut lookups = 0;
            for _ in 0..100 {
                if mix.draw() == QueryKind::PointLookup {
                    lookups += 1;
                }
            }
            assert_eq!(lookups, 70, "exact schedule must hit the quota per block");
        }
    }

    // ── End-to-end worker behavior over the memory bus ────────────

    #[test]
    fn worker_executes_and_reports_until_stopped() {
        let json = scenario_json(5, 3);
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);

        thread::sleep(Duration::from_millis(500));
        h.send(ControlPayload::Stop);
        let outcome = handle.join().unwrap();

        assert!(outcome.queries_processed > 10, "worker barely ran");
        assert_eq!(outcome.error_count, 0);

        // Persisted executions match the worker's own count, modulo nothing
        // in flight after a clean drain.
        let executions = h.bus.executions(h.run_id).unwrap();
        assert_eq!(executions.len() as u64, outcome.queries_processed);

        // Final heartbeat is COMPLETED with no active connections.
        let hb = &h.bus.heartbeats(h.run_id).unwrap()[0];
        assert_eq!(hb.status, WorkerStatus::Completed);
        assert_eq!(hb.active_connections, 0);
        assert_eq!(hb.queries_processed, outcome.queries_processed);
    }

    #[test]
    fn worker_tracks_target_changes_both_directions() {
        let json = scenario_json(5, 2);
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);
        thread::sleep(Duration::from_millis(300));

        h.send(ControlPayload::SetTargetConcurrency { target: 6 });
        thread::sleep(Duration::from_millis(400));
        let hb = &h.bus.heartbeats(h.run_id).unwrap()[0];
        assert_eq!(hb.target_connections, 6);
        assert_eq!(hb.active_connections, 6, "raised target not reached");

        h.send(ControlPayload::SetTargetConcurrency { target: 1 });
        thread::sleep(Duration::from_millis(400));
        let hb = &h.bus.heartbeats(h.run_id).unwrap()[0];
        assert_eq!(hb.active_connections, 1, "excess executors not drained");

        h.send(ControlPayload::Stop);
        handle.join().unwrap();
    }

    #[test]
    fn warmup_tag_follows_phase_at_start() {
        let json = scenario_json(5, 2).replace(
            r#""duration_seconds": 10,"#,
            r#""duration_seconds": 10, "warmup_seconds": 5,"#,
        );
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);
        thread::sleep(Duration::from_millis(250));

        h.send(ControlPayload::SetPhase { phase: Phase::Measurement });
        thread::sleep(Duration::from_millis(250));
        h.send(ControlPayload::Stop);
        handle.join().unwrap();

        let executions = h.bus.executions(h.run_id).unwrap();
        assert!(executions.iter().any(|e| e.warmup), "no warmup-tagged ops");
        assert!(executions.iter().any(|e| !e.warmup), "no measurement ops");
        // Ops are tagged by their start phase: warmup-tagged ops all started
        // before the measurement-tagged ones, modulo the sub-interval skew
        // between capturing the timestamp and reading the phase flag.
        let last_warmup = executions
            .iter()
            .filter(|e| e.warmup)
            .map(|e| e.start_time)
            .max()
            .unwrap();
        let first_measured = executions
            .iter()
            .filter(|e| !e.warmup)
            .map(|e| e.start_time)
            .min()
            .unwrap();
        assert!(
            last_warmup <= first_measured + chrono::Duration::milliseconds(100),
            "warmup-tagged op started {}ms after the first measured op",
            (last_warmup - first_measured).num_milliseconds()
        );
    }

    #[test]
    fn abort_cancels_in_flight_operations() {
        // One executor stuck in a 30-second operation; ABORT must cut it.
        let json = scenario_json(30_000, 1);
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        h.send(ControlPayload::Abort);
        let outcome = handle.join().unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "abort did not interrupt the blocked executor"
        );
        let executions = h.bus.executions(h.run_id).unwrap();
        assert!(
            executions
                .iter()
                .any(|e| e.error_class == Some(crate::types::ErrorClass::Cancelled)),
            "cancelled operation not recorded"
        );
        assert!(outcome.error_count >= 1);
    }

    #[test]
    fn pause_halts_new_operations_and_resume_restarts() {
        let json = scenario_json(5, 2);
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);
        thread::sleep(Duration::from_millis(300));

        h.send(ControlPayload::Pause);
        thread::sleep(Duration::from_millis(200));
        let processed_at_pause = h.bus.heartbeats(h.run_id).unwrap()[0].queries_processed;
        thread::sleep(Duration::from_millis(300));
        let processed_later = h.bus.heartbeats(h.run_id).unwrap()[0].queries_processed;
        assert!(
            processed_later <= processed_at_pause + 2,
            "operations kept flowing while paused ({processed_at_pause} -> {processed_later})"
        );

        h.send(ControlPayload::Resume);
        thread::sleep(Duration::from_millis(300));
        let processed_resumed = h.bus.heartbeats(h.run_id).unwrap()[0].queries_processed;
        assert!(
            processed_resumed > processed_later + 5,
            "resume did not restart the executors"
        );

        h.send(ControlPayload::Stop);
        handle.join().unwrap();
    }

    #[test]
    fn sustained_failures_report_draining_with_last_error() {
        let json = scenario_json(2, 2).replace(
            r#""params": {"latency_ms": 2}"#,
            r#""params": {"latency_ms": 2, "fail_rate": 1.0}"#,
        );
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);

        // Three 100 ms reporter intervals at 100% errors trip the threshold.
        thread::sleep(Duration::from_millis(700));
        let hb = &h.bus.heartbeats(h.run_id).unwrap()[0];
        assert_eq!(hb.status, WorkerStatus::Draining);
        assert!(hb.last_error.is_some());
        assert!(hb.error_count > 0);

        h.send(ControlPayload::Stop);
        handle.join().unwrap();
    }

    #[test]
    fn snapshots_cover_each_second_with_kind_counts() {
        let json = scenario_json(5, 2);
        let mut h = Harness::start(&json);
        let handle = h.spawn_worker(&json);
        thread::sleep(Duration::from_millis(550));
        h.send(ControlPayload::Stop);
        handle.join().unwrap();

        let snaps = h.bus.snapshots(h.run_id, 0).unwrap();
        assert!(!snaps.is_empty());
        let total_ops: u64 = snaps.iter().map(|s| s.ops).sum();
        let by_kind: u64 = snaps
            .iter()
            .flat_map(|s| s.ops_by_kind.values())
            .sum();
        assert_eq!(total_ops, by_kind, "kind counts must sum to ops");
        for s in &snaps {
            assert_eq!(s.worker_id, "w1");
            if s.ops > 0 {
                assert!(s.p95_ms >= s.p50_ms);
                assert!(s.p99_ms >= s.p95_ms);
            }
        }
    }
}
