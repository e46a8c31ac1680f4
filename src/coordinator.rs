//! # Run Coordinator — Lifecycle State Machine
//!
//! One coordinator instance owns one run. It is the only writer of the run
//! row and the control-event log, and it never talks to a worker directly —
//! everything goes through the bus.
//!
//! ```text
//! PREPARED → RUNNING → STOPPING → {COMPLETED, FAILED, CANCELLED}
//! PREPARED → FAILED                (setup failure)
//! RUNNING  → FAILED                (hard error, e.g. workers dead)
//! ```
//!
//! Within RUNNING, phase advances WARMUP → MEASUREMENT → COOLDOWN on the
//! configured elapsed times (WARMUP skipped when zero). Per load mode the
//! coordinator holds the concurrency target constant (FIXED), adjusts it
//! with a bounded proportional controller (TARGET_QPS), or delegates the
//! ladder to the FIND_MAX controller.
//!
//! User stop/abort arrives as a one-shot request flag on the run row (the
//! pending-command pattern); the coordinator converts it into proper STOP or
//! ABORT control events so the event log keeps a single writer.

use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use chrono::Utc;

use crate::aggregate::{Aggregator, RunSummary, WindowMetrics};
use crate::bus::Bus;
use crate::error::{reason, BusError, ConfigError};
use crate::find_max::{FindMaxController, StepMetrics, StopReason};
use crate::scenario::{ConcurrencyBounds, LoadProfile, Scenario};
use crate::types::{
    ControlEvent, ControlPayload, Phase, RunRecord, RunStatus, StepRecord, WorkerHeartbeat,
    WorkerStatus,
};

/// Coordinator-side timing knobs. Tests compress these to run scenarios in
/// hundreds of milliseconds.
#[derive(Debug, Clone)]
pub struct CoordinatorTuning {
    /// Main loop cadence.
    pub tick_interval: Duration,
    pub registration_grace: Duration,
    pub liveness_timeout: Duration,
    /// DEAD workers ≥ this fraction of expected aborts the run.
    pub max_dead_fraction: f64,
    pub stop_grace: Duration,
    pub abort_grace: Duration,
    pub bus_failure_grace: Duration,
    /// Window width for the TARGET_QPS controller and current-QPS readout.
    pub qps_window_seconds: u64,
    /// Hysteresis: no adjustment while |error| ≤ band × target.
    pub qps_error_band: f64,
    /// Bounded step: per-worker target never moves more than this per
    /// adjustment.
    pub qps_max_step: u32,
    /// Seconds of wall clock per logical bucket. 1.0 in production; tests
    /// shrink it to run multi-step scenarios in milliseconds.
    pub bucket_seconds: f64,
}

impl Default for CoordinatorTuning {
    fn default() -> Self {
        CoordinatorTuning {
            tick_interval: Duration::from_millis(250),
            registration_grace: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(10),
            max_dead_fraction: 0.5,
            stop_grace: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            bus_failure_grace: Duration::from_secs(30),
            qps_window_seconds: 5,
            qps_error_band: 0.05,
            qps_max_step: 4,
            bucket_seconds: 1.0,
        }
    }
}

/// User-visible terminal state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub reason_code: Option<String>,
    pub reason_message: Option<String>,
    pub partial_results_available: bool,
    pub summary: Option<RunSummary>,
}

/// Bounded proportional adjustment for the TARGET_QPS closed loop.
///
/// Returns the new per-worker target, or None when the measured QPS sits
/// inside the hysteresis band (or the window has no data). The step is
/// derived from the observed per-connection throughput and clamped to
/// `max_step`, so a noisy window cannot slam the pool.
pub fn qps_adjustment(
    current: u32,
    workers: u32,
    window: &WindowMetrics,
    target_qps: f64,
    bounds: ConcurrencyBounds,
    error_band: f64,
    max_step: u32,
) -> Option<u32> {
    if !window.available {
        return None;
    }
    let error = target_qps - window.qps;
    if error.abs() <= error_band * target_qps {
        return None;
    }
    let workers = workers.max(1);
    let total_conns = (current.max(1) * workers) as f64;
    let per_conn = window.qps / total_conns;
    let delta_total = if per_conn > 0.0 {
        error / per_conn
    } else {
        // Nothing measured yet: probe upward one connection per worker.
        workers as f64 * error.signum()
    };
    let mut delta = (delta_total / workers as f64).round() as i64;
    delta = delta.clamp(-(max_step as i64), max_step as i64);
    if delta == 0 {
        delta = error.signum() as i64;
    }
    let next = (current as i64 + delta).clamp(bounds.min as i64, bounds.max as i64) as u32;
    (next != current).then_some(next)
}

enum ModeState {
    Fixed,
    TargetQps {
        target_qps: f64,
        bounds: ConcurrencyBounds,
        last_adjust_bucket: u64,
    },
    FindMax {
        controller: FindMaxController,
        step_started_bucket: u64,
        /// Set when the ladder has ended and COOLDOWN is running.
        cooldown_since: Option<Instant>,
    },
}

#[derive(Debug)]
pub struct Coordinator {
    bus: Arc<dyn Bus>,
    tuning: CoordinatorTuning,
    run: RunRecord,
    aggregator: Aggregator,
    current_target: u32,
    stop_emitted: bool,
    abort_emitted: bool,
    stopping_since: Option<Instant>,
    bus_down_since: Option<Instant>,
    failure: Option<(String, String)>,
    invariant_violated: bool,
    user_cancel: bool,
}

impl Coordinator {
    /// Admission: validate the scenario, create the PREPARED run record.
    pub fn submit(
        bus: Arc<dyn Bus>,
        scenario: Scenario,
        run_id: Option<Uuid>,
        tuning: CoordinatorTuning,
    ) -> Result<Coordinator, SubmitError> {
        // The scenario was structurally validated at parse; admission also
        // checks that the adapter actually exists in the registry.
        crate::adapter::create(&scenario.target.adapter)?;

        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let run = RunRecord::new(run_id, scenario);
        bus.create_run(&run)?;
        tracing::info!(%run_id, template = %run.scenario.template_id, mode = run.scenario.load.mode_str(), "run admitted");

        let aggregator = Aggregator::new(Arc::clone(&bus), run_id);
        let current_target = run.scenario.load.initial_target();
        Ok(Coordinator {
            bus,
            tuning,
            run,
            aggregator,
            current_target,
            stop_emitted: false,
            abort_emitted: false,
            stopping_since: None,
            bus_down_since: None,
            failure: None,
            invariant_violated: false,
            user_cancel: false,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    /// Scenario seconds → wall-clock duration under the configured bucket
    /// scale.
    fn scaled(&self, seconds: u64) -> Duration {
        Duration::from_secs_f64(seconds as f64 * self.tuning.bucket_seconds)
    }

    /// Drive the run to a terminal state. Never panics on expected failures;
    /// the outcome carries the terminal status and reason.
    pub fn run(mut self) -> RunOutcome {
        if let Err(timeout) = self.await_registration() {
            tracing::error!(run_id = %self.run.run_id, "registration timed out");
            return self.finish(
                RunStatus::Failed,
                Some((
                    reason::REGISTRATION_TIMEOUT.into(),
                    format!(
                        "{} of {} workers registered within {:?}",
                        timeout, self.run.total_workers_expected, self.tuning.registration_grace
                    ),
                )),
                false,
            );
        }

        if let Err(e) = self.start_run() {
            tracing::error!(run_id = %self.run.run_id, error = %e, "failed to start run");
            return self.finish(
                RunStatus::Failed,
                Some((reason::SETUP_FAILURE.into(), e.to_string())),
                false,
            );
        }

        let epoch = Instant::now();
        let mut mode = self.initial_mode_state();

        loop {
            std::thread::sleep(self.tuning.tick_interval);
            let now_bucket =
                (epoch.elapsed().as_secs_f64() / self.tuning.bucket_seconds) as u64;

            let heartbeats = match self.bus.heartbeats(self.run.run_id) {
                Ok(rows) => {
                    self.bus_down_since = None;
                    rows
                }
                Err(err) => {
                    tracing::warn!(error = %err, "heartbeat poll failed");
                    let since = *self.bus_down_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.tuning.bus_failure_grace {
                        self.failure = Some((
                            reason::BUS_UNAVAILABLE.into(),
                            "coordination store unavailable beyond grace".into(),
                        ));
                        break;
                    }
                    continue;
                }
            };

            self.update_worker_counters(&heartbeats);
            if self.check_liveness(&heartbeats) {
                // Too many dead: ABORT and fail.
                self.emit_abort();
                self.failure.get_or_insert((
                    reason::WORKERS_DEAD.into(),
                    "dead workers reached max_dead_fraction".into(),
                ));
            }

            self.check_user_requests();

            if self.stopping_since.is_none() && !self.invariant_violated {
                self.advance_phase_and_mode(epoch, now_bucket, &mut mode);
            }

            if self.invariant_violated {
                break;
            }

            if let Some(since) = self.stopping_since {
                let grace = if self.abort_emitted {
                    self.tuning.abort_grace
                } else {
                    self.tuning.stop_grace
                };
                let live = heartbeats
                    .iter()
                    .filter(|h| h.status != WorkerStatus::Dead)
                    .count() as u32;
                let done = self.run.workers_completed >= live.min(self.run.workers_registered);
                if done {
                    break;
                }
                if since.elapsed() > grace {
                    // Laggards are marked DEAD and the run closes without them.
                    for hb in heartbeats
                        .iter()
                        .filter(|h| h.status != WorkerStatus::Completed)
                    {
                        let _ = self.bus.mark_worker_dead(self.run.run_id, &hb.worker_id);
                    }
                    if !self.user_cancel {
                        self.failure.get_or_insert((
                            if self.abort_emitted {
                                reason::ABORT_GRACE_TIMEOUT.into()
                            } else {
                                reason::STOP_GRACE_TIMEOUT.into()
                            },
                            "workers did not drain within grace".into(),
                        ));
                    }
                    break;
                }
            }

            // Refresh the live readout fields on the run row.
            if let Ok(window) = self
                .aggregator
                .window(self.tuning.qps_window_seconds, now_bucket)
            {
                if window.available {
                    self.run.current_qps = window.qps;
                }
            }
            if let Err(err) = self.bus.update_run(&self.run) {
                tracing::warn!(error = %err, "run row update failed");
            }
        }

        self.resolve_terminal(&mode)
    }

    fn await_registration(&mut self) -> Result<(), u32> {
        let deadline = Instant::now() + self.tuning.registration_grace;
        loop {
            let registered = self
                .bus
                .heartbeats(self.run.run_id)
                .map(|rows| rows.len() as u32)
                .unwrap_or(0);
            self.run.workers_registered = registered;
            if registered >= self.run.total_workers_expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(registered);
            }
            std::thread::sleep(self.tuning.tick_interval);
        }
    }

    fn start_run(&mut self) -> Result<(), BusError> {
        self.set_status(RunStatus::Running);
        self.run.start_time = Some(Utc::now());
        let initial_phase = if self.run.scenario.warmup_seconds > 0 {
            Phase::Warmup
        } else {
            Phase::Measurement
        };
        self.run.phase = initial_phase;
        self.emit(ControlPayload::SetPhase {
            phase: initial_phase,
        })?;
        self.emit(ControlPayload::SetTargetConcurrency {
            target: self.current_target,
        })?;
        self.bus.update_run(&self.run)?;
        tracing::info!(run_id = %self.run.run_id, phase = %initial_phase, target = self.current_target, "run started");
        Ok(())
    }

    fn initial_mode_state(&self) -> ModeState {
        match &self.run.scenario.load {
            LoadProfile::FixedConcurrency { .. } => ModeState::Fixed,
            LoadProfile::TargetQps { target_qps, bounds } => ModeState::TargetQps {
                target_qps: *target_qps,
                bounds: *bounds,
                last_adjust_bucket: 0,
            },
            LoadProfile::FindMaxConcurrency { find_max } => ModeState::FindMax {
                controller: match &self.run.find_max_state {
                    Some(state) => FindMaxController::from_state(find_max.clone(), state),
                    None => FindMaxController::new(find_max.clone()),
                },
                step_started_bucket: 0,
                cooldown_since: None,
            },
        }
    }

    fn advance_phase_and_mode(&mut self, epoch: Instant, now_bucket: u64, mode: &mut ModeState) {
        let scenario = self.run.scenario.clone();
        let elapsed = epoch.elapsed();
        let warmup_end = self.scaled(scenario.warmup_seconds);
        let measure_end = self.scaled(scenario.warmup_seconds + scenario.duration_seconds);
        let total_end = self.scaled(scenario.total_seconds());

        if self.run.phase == Phase::Warmup && elapsed >= warmup_end {
            self.run.warmup_end_time = Some(Utc::now());
            self.set_phase(Phase::Measurement);
            if let ModeState::FindMax {
                step_started_bucket,
                ..
            } = mode
            {
                *step_started_bucket = now_bucket;
            }
        }

        match mode {
            ModeState::Fixed => {
                if self.run.phase == Phase::Measurement && elapsed >= measure_end {
                    if scenario.cooldown_seconds > 0 {
                        self.set_phase(Phase::Cooldown);
                    } else {
                        self.emit_stop();
                    }
                } else if self.run.phase == Phase::Cooldown && elapsed >= total_end {
                    self.emit_stop();
                }
            }
            ModeState::TargetQps {
                target_qps,
                bounds,
                last_adjust_bucket,
            } => {
                if self.run.phase == Phase::Measurement && elapsed >= measure_end {
                    if scenario.cooldown_seconds > 0 {
                        self.set_phase(Phase::Cooldown);
                    } else {
                        self.emit_stop();
                    }
                    return;
                }
                if self.run.phase == Phase::Cooldown && elapsed >= total_end {
                    self.emit_stop();
                    return;
                }
                // Closed loop: one adjustment opportunity per bucket.
                if self.run.phase == Phase::Measurement && now_bucket > *last_adjust_bucket {
                    *last_adjust_bucket = now_bucket;
                    if let Ok(window) = self
                        .aggregator
                        .window(self.tuning.qps_window_seconds, now_bucket)
                    {
                        let workers = self.run.workers_registered.max(1);
                        if let Some(next) = qps_adjustment(
                            self.current_target,
                            workers,
                            &window,
                            *target_qps,
                            *bounds,
                            self.tuning.qps_error_band,
                            self.tuning.qps_max_step,
                        ) {
                            tracing::debug!(
                                from = self.current_target,
                                to = next,
                                qps = window.qps,
                                "qps controller adjusting target"
                            );
                            self.current_target = next;
                            self.emit_checked(ControlPayload::SetTargetConcurrency {
                                target: next,
                            });
                        }
                    }
                }
            }
            ModeState::FindMax {
                controller,
                step_started_bucket,
                cooldown_since,
            } => {
                // Phase ordering holds here too: the ladder's end flows
                // through COOLDOWN (when configured) before STOP.
                if self.run.phase == Phase::Cooldown {
                    let cooled = cooldown_since
                        .map(|since| since.elapsed() >= self.scaled(scenario.cooldown_seconds))
                        .unwrap_or(true);
                    if cooled {
                        self.emit_stop();
                    }
                    return;
                }
                if self.run.phase != Phase::Measurement {
                    return;
                }
                // The scenario duration is a hard cap on the whole ladder.
                if elapsed >= measure_end {
                    controller.stop_external(StopReason::MeasurementCap);
                    self.run.find_max_state = Some(controller.to_state());
                    if scenario.cooldown_seconds > 0 {
                        self.set_phase(Phase::Cooldown);
                        *cooldown_since = Some(Instant::now());
                    } else {
                        self.emit_stop();
                    }
                    return;
                }
                let step_ready = now_bucket
                    >= *step_started_bucket
                        + controller.warmup_seconds()
                        + controller.step_duration_seconds();
                if !step_ready {
                    return;
                }
                let window = match self
                    .aggregator
                    .window(controller.step_duration_seconds(), now_bucket)
                {
                    Ok(w) if w.available => w,
                    // No samples yet (workers still ramping): extend the step.
                    _ => return,
                };
                let metrics = StepMetrics {
                    qps: window.qps,
                    p50_ms: window.p50_ms,
                    p95_ms: window.p95_ms,
                    p99_ms: window.p99_ms,
                    error_rate: window.error_rate,
                    queued_fraction: window.queued_fraction,
                };
                let evaluation = controller.evaluate_step(&metrics);
                let record = StepRecord {
                    run_id: self.run.run_id,
                    step_number: evaluation.step_number,
                    target_workers: evaluation.target_workers,
                    qps: metrics.qps,
                    p50_ms: metrics.p50_ms,
                    p95_ms: metrics.p95_ms,
                    p99_ms: metrics.p99_ms,
                    error_rate: metrics.error_rate,
                    queue_detected: metrics.queued_fraction > 0.5,
                    outcome: evaluation.outcome,
                    stop_reason: evaluation.stop_reason.map(|r| r.as_str().to_string()),
                };
                if let Err(err) = self.bus.append_step(&record) {
                    tracing::warn!(error = %err, "step record append failed");
                }
                self.run.find_max_state = Some(controller.to_state());
                tracing::info!(
                    step = evaluation.step_number,
                    target = evaluation.target_workers,
                    outcome = ?evaluation.outcome,
                    qps = metrics.qps,
                    "find_max step evaluated"
                );
                match evaluation.next_target {
                    Some(next) => {
                        self.current_target = next;
                        self.emit_checked(ControlPayload::SetTargetConcurrency { target: next });
                        *step_started_bucket = now_bucket;
                    }
                    None => {
                        if scenario.cooldown_seconds > 0 {
                            self.set_phase(Phase::Cooldown);
                            *cooldown_since = Some(Instant::now());
                        } else {
                            self.emit_stop();
                        }
                    }
                }
            }
        }
    }

    fn update_worker_counters(&mut self, heartbeats: &[WorkerHeartbeat]) {
        self.run.workers_registered = heartbeats.len() as u32;
        self.run.workers_active = heartbeats
            .iter()
            .filter(|h| {
                matches!(
                    h.status,
                    WorkerStatus::Running | WorkerStatus::Draining | WorkerStatus::Waiting
                )
            })
            .count() as u32;
        self.run.workers_completed = heartbeats
            .iter()
            .filter(|h| h.status == WorkerStatus::Completed)
            .count() as u32;
        self.run.total_ops = heartbeats.iter().map(|h| h.queries_processed).sum();
        self.run.error_count = heartbeats.iter().map(|h| h.error_count).sum();
    }

    /// Mark stale workers DEAD. Returns true when the dead fraction crosses
    /// the abort threshold.
    fn check_liveness(&mut self, heartbeats: &[WorkerHeartbeat]) -> bool {
        let now = Utc::now();
        let mut dead = 0u32;
        for hb in heartbeats {
            match hb.status {
                WorkerStatus::Dead => dead += 1,
                WorkerStatus::Completed => {}
                _ => {
                    let age = now - hb.last_heartbeat;
                    if age.num_milliseconds() as f64
                        > self.tuning.liveness_timeout.as_millis() as f64
                    {
                        tracing::warn!(worker_id = %hb.worker_id, "worker heartbeat stale, marking DEAD");
                        let _ = self.bus.mark_worker_dead(self.run.run_id, &hb.worker_id);
                        dead += 1;
                    }
                }
            }
        }
        let expected = self.run.total_workers_expected.max(1);
        dead > 0 && (dead as f64 / expected as f64) >= self.tuning.max_dead_fraction
    }

    fn check_user_requests(&mut self) {
        let Ok(Some(row)) = self.bus.get_run(self.run.run_id) else {
            return;
        };
        if row.abort_requested && !self.abort_emitted {
            tracing::info!(run_id = %self.run.run_id, "user abort requested");
            self.user_cancel = true;
            self.emit_abort();
        } else if row.stop_requested && !self.stop_emitted {
            tracing::info!(run_id = %self.run.run_id, "user stop requested");
            self.emit_stop();
        }
    }

    fn emit(&mut self, payload: ControlPayload) -> Result<(), BusError> {
        let seq = self.run.next_sequence_id + 1;
        let event = ControlEvent::new(self.run.run_id, seq, payload);
        self.bus.append_event(&event)?;
        self.run.next_sequence_id = seq;
        Ok(())
    }

    /// Emit, escalating an invariant violation to immediate run failure.
    fn emit_checked(&mut self, payload: ControlPayload) {
        match self.emit(payload) {
            Ok(()) => {}
            Err(BusError::Invariant(msg)) => {
                tracing::error!(error = %msg, "control log invariant violated");
                self.invariant_violated = true;
                self.failure = Some((reason::INVARIANT_VIOLATION.into(), msg));
            }
            Err(err) => {
                tracing::warn!(error = %err, "control event append failed");
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.run.phase = phase;
        self.emit_checked(ControlPayload::SetPhase { phase });
        tracing::info!(run_id = %self.run.run_id, phase = %phase, "phase advanced");
    }

    fn emit_stop(&mut self) {
        if self.stop_emitted || self.abort_emitted {
            return;
        }
        self.stop_emitted = true;
        self.set_status(RunStatus::Stopping);
        self.stopping_since = Some(Instant::now());
        self.emit_checked(ControlPayload::Stop);
        tracing::info!(run_id = %self.run.run_id, "stop issued");
    }

    fn emit_abort(&mut self) {
        if self.abort_emitted {
            return;
        }
        self.abort_emitted = true;
        self.set_status(RunStatus::Stopping);
        self.stopping_since = Some(Instant::now());
        self.emit_checked(ControlPayload::Abort);
        tracing::info!(run_id = %self.run.run_id, "abort issued");
    }

    fn set_status(&mut self, status: RunStatus) {
        self.run.status = status;
    }

    fn resolve_terminal(&mut self, mode: &ModeState) -> RunOutcome {
        if self.invariant_violated {
            // No partial aggregates after an invariant violation.
            let failure = self.failure.clone();
            return self.finish(RunStatus::Failed, failure, false);
        }

        let find_max_report = match mode {
            ModeState::FindMax { controller, .. } => Some(controller.report()),
            _ => None,
        };

        let summary = match self.aggregator.finalize(&self.run, find_max_report) {
            Ok(summary) => {
                if let Err(err) = self.bus.write_summary(self.run.run_id, &summary) {
                    tracing::warn!(error = %err, "summary write failed");
                }
                Some(summary)
            }
            Err(err) => {
                tracing::warn!(error = %err, "aggregate finalize failed");
                None
            }
        };

        let dead_workers = self
            .bus
            .heartbeats(self.run.run_id)
            .map(|rows| rows.iter().any(|h| h.status == WorkerStatus::Dead))
            .unwrap_or(false);

        let (status, failure) = if self.user_cancel {
            (
                RunStatus::Cancelled,
                Some((reason::USER_ABORT.into(), "aborted by user".into())),
            )
        } else if let Some(f) = self.failure.clone() {
            (RunStatus::Failed, Some(f))
        } else if dead_workers {
            (
                RunStatus::Failed,
                Some((
                    reason::WORKERS_DEAD.into(),
                    "one or more workers died during the run".into(),
                )),
            )
        } else {
            (RunStatus::Completed, None)
        };

        let mut outcome = self.finish(status, failure, summary.is_some());
        outcome.summary = summary;
        outcome
    }

    fn finish(
        &mut self,
        status: RunStatus,
        failure: Option<(String, String)>,
        partial_results: bool,
    ) -> RunOutcome {
        self.set_status(status);
        self.run.end_time = Some(Utc::now());
        if let Some((code, message)) = &failure {
            self.run.reason_code = Some(code.clone());
            self.run.reason_message = Some(message.clone());
        }
        if let Err(err) = self.bus.update_run(&self.run) {
            tracing::error!(error = %err, "terminal run update failed");
        }
        tracing::info!(
            run_id = %self.run.run_id,
            status = %status,
            reason = self.run.reason_code.as_deref().unwrap_or("-"),
            total_ops = self.run.total_ops,
            "run closed"
        );
        RunOutcome {
            run_id: self.run.run_id,
            status,
            reason_code: self.run.reason_code.clone(),
            reason_message: self.run.reason_message.clone(),
            partial_results_available: partial_results,
            summary: None,
        }
    }
}

/// Admission failure: configuration or store.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
