//! # FIND_MAX Controller — Step-Based Concurrency Search
//!
//! Raises target concurrency step by step until the system degrades, then
//! reports the highest *stable* concurrency observed. The controller is a
//! pure evaluator: the coordinator owns waiting, warmup discard, and window
//! collection, and feeds each step's measured metrics into
//! [`FindMaxController::evaluate_step`].
//!
//! ## Classification (in order)
//!
//! 1. **ERROR_THRESHOLD** — `error_rate > error_rate_pct`. Stop.
//! 2. **DEGRADED** — QPS fell below `best_qps × (1 − qps_drop_pct)`, or p95
//!    inflated past `baseline_p95 × (1 + p95_inflation_pct)`, or more than
//!    half the step's seconds were queued. Stop.
//! 3. **STABLE** — record a new best if this step's QPS beats it, advance.
//!
//! Baselines: `baseline_p95` is the p95 of the first STABLE step; `best_qps`
//! is the max over all STABLE steps (ties broken by earliest step).

use serde::{Deserialize, Serialize};

use crate::scenario::{FindMaxConfig, Increment};
use crate::types::{FindMaxState, StepOutcome};

/// Measured metrics for one completed step window (warmup already
/// discarded).
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub qps: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Failed operations / total operations, in [0, 1].
    pub error_rate: f64,
    /// Fraction of the step's seconds flagged as queued, in [0, 1].
    pub queued_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    DegradedQps,
    DegradedP95,
    DegradedQueue,
    ErrorThreshold,
    CapReached,
    MeasurementCap,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::DegradedQps => "DEGRADED_QPS",
            StopReason::DegradedP95 => "DEGRADED_P95",
            StopReason::DegradedQueue => "DEGRADED_QUEUE",
            StopReason::ErrorThreshold => "ERROR_THRESHOLD",
            StopReason::CapReached => "CAP_REACHED",
            StopReason::MeasurementCap => "MEASUREMENT_CAP",
        }
    }
}

/// The controller's verdict after one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvaluation {
    pub step_number: u32,
    pub target_workers: u32,
    pub outcome: StepOutcome,
    /// Set when the search ends with this step.
    pub stop_reason: Option<StopReason>,
    /// Next target to issue, when the search continues.
    pub next_target: Option<u32>,
}

/// Final search report, persisted with the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindMaxReport {
    pub best_stable_concurrency: Option<u32>,
    pub best_stable_qps: f64,
    /// First DEGRADED (or ERROR_THRESHOLD) step's target, null if the cap
    /// was reached without degradation.
    pub degradation_point: Option<u32>,
    /// Steps completed before the degrading step.
    pub steps_to_degradation: Option<u32>,
    pub degradation_reason: Option<String>,
    pub stop_reason: String,
}

#[derive(Debug, Clone)]
pub struct FindMaxController {
    cfg: FindMaxConfig,
    step_number: u32,
    current_target: u32,
    best_qps: f64,
    best_stable_concurrency: Option<u32>,
    baseline_p95: Option<f64>,
    degradation_point: Option<u32>,
    steps_to_degradation: Option<u32>,
    stop_reason: Option<StopReason>,
}

impl FindMaxController {
    pub fn new(cfg: FindMaxConfig) -> Self {
        let start = cfg.start;
        FindMaxController {
            cfg,
            step_number: 0,
            current_target: start,
            best_qps: 0.0,
            best_stable_concurrency: None,
            baseline_p95: None,
            degradation_point: None,
            steps_to_degradation: None,
            stop_reason: None,
        }
    }

    /// Resume from a state snapshot carried on the run row.
    pub fn from_state(cfg: FindMaxConfig, state: &FindMaxState) -> Self {
        FindMaxController {
            cfg,
            step_number: state.step_number,
            current_target: state.current_target,
            best_qps: state.best_qps,
            best_stable_concurrency: state.best_stable_concurrency,
            baseline_p95: state.baseline_p95_ms,
            degradation_point: None,
            steps_to_degradation: None,
            stop_reason: None,
        }
    }

    pub fn to_state(&self) -> FindMaxState {
        FindMaxState {
            step_number: self.step_number,
            current_target: self.current_target,
            best_qps: self.best_qps,
            best_stable_concurrency: self.best_stable_concurrency,
            baseline_p95_ms: self.baseline_p95,
        }
    }

    /// Target concurrency for the step currently being measured.
    pub fn current_target(&self) -> u32 {
        self.current_target
    }

    pub fn step_duration_seconds(&self) -> u64 {
        self.cfg.t_step_seconds
    }

    pub fn warmup_seconds(&self) -> u64 {
        self.cfg.t_warm_seconds
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason.is_some()
    }

    fn next_target_after(&self, target: u32) -> u32 {
        match self.cfg.increment {
            Increment::Linear { delta } => target.saturating_add(delta),
            // Geometric always advances by at least one connection.
            Increment::Geometric { factor } => {
                let scaled = (target as f64 * factor).round() as u32;
                scaled.max(target + 1)
            }
        }
    }

    /// Classify one completed step and decide whether to continue.
    pub fn evaluate_step(&mut self, m: &StepMetrics) -> StepEvaluation {
        let step_number = self.step_number;
        let target = self.current_target;
        let t = self.cfg.thresholds;

        let (outcome, stop_reason) = if m.error_rate > t.error_rate_pct {
            (StepOutcome::ErrorThreshold, Some(StopReason::ErrorThreshold))
        } else if self.best_qps > 0.0 && m.qps < self.best_qps * (1.0 - t.qps_drop_pct) {
            (StepOutcome::Degraded, Some(StopReason::DegradedQps))
        } else if self
            .baseline_p95
            .map(|base| m.p95_ms > base * (1.0 + t.p95_inflation_pct))
            .unwrap_or(false)
        {
            (StepOutcome::Degraded, Some(StopReason::DegradedP95))
        } else if m.queued_fraction > 0.5 {
            (StepOutcome::Degraded, Some(StopReason::DegradedQueue))
        } else {
            (StepOutcome::Stable, None)
        };

        let evaluation = match outcome {
            StepOutcome::Stable => {
                if self.baseline_p95.is_none() {
                    self.baseline_p95 = Some(m.p95_ms);
                }
                if m.qps > self.best_qps {
                    self.best_qps = m.qps;
                }
                // Highest stable target; targets are strictly increasing.
                self.best_stable_concurrency = Some(target);

                let next = self.next_target_after(target);
                if next > self.cfg.max {
                    self.stop_reason = Some(StopReason::CapReached);
                    StepEvaluation {
                        step_number,
                        target_workers: target,
                        outcome,
                        stop_reason: Some(StopReason::CapReached),
                        next_target: None,
                    }
                } else {
                    self.step_number += 1;
                    self.current_target = next;
                    StepEvaluation {
                        step_number,
                        target_workers: target,
                        outcome,
                        stop_reason: None,
                        next_target: Some(next),
                    }
                }
            }
            StepOutcome::Degraded | StepOutcome::ErrorThreshold => {
                self.degradation_point = Some(target);
                self.steps_to_degradation = Some(step_number);
                self.stop_reason = stop_reason;
                StepEvaluation {
                    step_number,
                    target_workers: target,
                    outcome,
                    stop_reason,
                    next_target: None,
                }
            }
        };
        evaluation
    }

    /// End the search early (measurement cap hit, run stopped).
    pub fn stop_external(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
    }

    pub fn report(&self) -> FindMaxReport {
        let stop = self.stop_reason.unwrap_or(StopReason::MeasurementCap);
        FindMaxReport {
            best_stable_concurrency: self.best_stable_concurrency,
            best_stable_qps: self.best_qps,
            degradation_point: self.degradation_point,
            steps_to_degradation: self.steps_to_degradation,
            degradation_reason: self
                .degradation_point
                .and(self.stop_reason)
                .map(|r| r.as_str().to_string()),
            stop_reason: stop.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::FindMaxThresholds;

    fn config(start: u32, max: u32, increment: Increment) -> FindMaxConfig {
        FindMaxConfig {
            start,
            max,
            increment,
            t_step_seconds: 10,
            t_warm_seconds: 2,
            thresholds: FindMaxThresholds {
                qps_drop_pct: 0.1,
                p95_inflation_pct: 0.5,
                error_rate_pct: 0.02,
            },
        }
    }

    fn stable(qps: f64, p95: f64) -> StepMetrics {
        StepMetrics {
            qps,
            p50_ms: p95 / 2.0,
            p95_ms: p95,
            p99_ms: p95 * 1.2,
            error_rate: 0.0,
            queued_fraction: 0.0,
        }
    }

    /// The S4 ladder: QPS(c) = min(c·50, 800) with latency collapse past 16.
    /// STABLE at 2, 4, 8, 16; DEGRADED (QPS) at 32.
    #[test]
    fn geometric_ladder_finds_the_knee() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Geometric { factor: 2.0 }));

        assert_eq!(c.current_target(), 2);
        let e = c.evaluate_step(&stable(100.0, 20.0));
        assert_eq!(e.outcome, StepOutcome::Stable);
        assert_eq!(e.next_target, Some(4));

        let e = c.evaluate_step(&stable(200.0, 20.0));
        assert_eq!(e.next_target, Some(8));
        let e = c.evaluate_step(&stable(400.0, 20.0));
        assert_eq!(e.next_target, Some(16));
        let e = c.evaluate_step(&stable(800.0, 20.0));
        assert_eq!(e.next_target, Some(32));

        // Past the knee: throughput collapses below best × 0.9.
        let e = c.evaluate_step(&stable(400.0, 80.0));
        assert_eq!(e.outcome, StepOutcome::Degraded);
        assert_eq!(e.stop_reason, Some(StopReason::DegradedQps));
        assert!(c.is_stopped());

        let report = c.report();
        assert_eq!(report.best_stable_concurrency, Some(16));
        assert_eq!(report.best_stable_qps, 800.0);
        assert_eq!(report.degradation_point, Some(32));
        assert_eq!(report.steps_to_degradation, Some(4));
        assert_eq!(report.degradation_reason.as_deref(), Some("DEGRADED_QPS"));
        assert_eq!(report.stop_reason, "DEGRADED_QPS");
    }

    #[test]
    fn p95_inflation_degrades_even_when_qps_holds() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Geometric { factor: 2.0 }));
        c.evaluate_step(&stable(100.0, 20.0)); // baseline p95 = 20
        let e = c.evaluate_step(&stable(110.0, 31.0)); // > 20 × 1.5
        assert_eq!(e.outcome, StepOutcome::Degraded);
        assert_eq!(e.stop_reason, Some(StopReason::DegradedP95));
        assert_eq!(c.report().degradation_reason.as_deref(), Some("DEGRADED_P95"));
    }

    #[test]
    fn queueing_majority_degrades() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Linear { delta: 2 }));
        c.evaluate_step(&stable(100.0, 20.0));
        let e = c.evaluate_step(&StepMetrics {
            queued_fraction: 0.6,
            ..stable(105.0, 21.0)
        });
        assert_eq!(e.stop_reason, Some(StopReason::DegradedQueue));
    }

    #[test]
    fn half_queued_step_is_still_stable() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Linear { delta: 2 }));
        let e = c.evaluate_step(&StepMetrics {
            queued_fraction: 0.5,
            ..stable(100.0, 20.0)
        });
        assert_eq!(e.outcome, StepOutcome::Stable);
    }

    #[test]
    fn error_threshold_stops_before_degradation_checks() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Linear { delta: 2 }));
        c.evaluate_step(&stable(100.0, 20.0));
        // Both error rate and QPS drop apply; the error check wins.
        let e = c.evaluate_step(&StepMetrics {
            error_rate: 0.05,
            ..stable(10.0, 500.0)
        });
        assert_eq!(e.outcome, StepOutcome::ErrorThreshold);
        assert_eq!(e.stop_reason, Some(StopReason::ErrorThreshold));
    }

    /// Boundary property 11: reaching c_max without a DEGRADED step stops
    /// with CAP_REACHED and best_stable_concurrency = c_max.
    #[test]
    fn cap_reached_without_degradation() {
        let mut c = FindMaxController::new(config(2, 8, Increment::Geometric { factor: 2.0 }));
        assert_eq!(c.evaluate_step(&stable(100.0, 20.0)).next_target, Some(4));
        assert_eq!(c.evaluate_step(&stable(200.0, 20.0)).next_target, Some(8));
        let e = c.evaluate_step(&stable(400.0, 20.0));
        assert_eq!(e.outcome, StepOutcome::Stable);
        assert_eq!(e.stop_reason, Some(StopReason::CapReached));
        assert_eq!(e.next_target, None);

        let report = c.report();
        assert_eq!(report.stop_reason, "CAP_REACHED");
        assert_eq!(report.best_stable_concurrency, Some(8));
        assert!(report.degradation_point.is_none());
        assert!(report.degradation_reason.is_none());
    }

    #[test]
    fn first_step_cannot_degrade_on_qps_or_p95() {
        // No best QPS and no baseline yet — a slow first step is stable.
        let mut c = FindMaxController::new(config(4, 64, Increment::Linear { delta: 4 }));
        let e = c.evaluate_step(&stable(1.0, 9999.0));
        assert_eq!(e.outcome, StepOutcome::Stable);
    }

    #[test]
    fn best_qps_keeps_maximum_across_stable_steps() {
        let mut c = FindMaxController::new(config(2, 100, Increment::Linear { delta: 2 }));
        c.evaluate_step(&stable(100.0, 20.0));
        c.evaluate_step(&stable(150.0, 20.0));
        // Within the 10% band: 140 ≥ 150 × 0.9 = 135, still stable.
        let e = c.evaluate_step(&stable(140.0, 20.0));
        assert_eq!(e.outcome, StepOutcome::Stable);
        let report = c.report();
        assert_eq!(report.best_stable_qps, 150.0);
        // Highest stable target is the latest stable step's target.
        assert_eq!(report.best_stable_concurrency, Some(6));
    }

    #[test]
    fn geometric_increment_always_advances() {
        let mut c = FindMaxController::new(config(1, 10, Increment::Geometric { factor: 1.2 }));
        // round(1 × 1.2) = 1 would stall; the controller forces ≥ +1.
        let e = c.evaluate_step(&stable(10.0, 5.0));
        assert_eq!(e.next_target, Some(2));
    }

    #[test]
    fn state_roundtrip_resumes_the_ladder() {
        let cfg = config(2, 64, Increment::Geometric { factor: 2.0 });
        let mut c = FindMaxController::new(cfg.clone());
        c.evaluate_step(&stable(100.0, 20.0));
        c.evaluate_step(&stable(200.0, 20.0));

        let state = c.to_state();
        let mut resumed = FindMaxController::from_state(cfg, &state);
        assert_eq!(resumed.current_target(), 8);
        // Same inputs produce the same decision after resume.
        let e = resumed.evaluate_step(&stable(400.0, 20.0));
        assert_eq!(e.next_target, Some(16));
        assert_eq!(resumed.report().best_stable_qps, 400.0);
    }

    #[test]
    fn external_stop_records_measurement_cap() {
        let mut c = FindMaxController::new(config(2, 64, Increment::Linear { delta: 2 }));
        c.evaluate_step(&stable(100.0, 20.0));
        c.stop_external(StopReason::MeasurementCap);
        assert!(c.is_stopped());
        let report = c.report();
        assert_eq!(report.stop_reason, "MEASUREMENT_CAP");
        assert_eq!(report.best_stable_concurrency, Some(2));
        assert!(report.degradation_point.is_none());
    }
}
