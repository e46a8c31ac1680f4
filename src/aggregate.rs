//! # Aggregate — Per-Run Metrics Merging
//!
//! Merges per-worker metric snapshots into per-run, per-second series, serves
//! the windowed queries the FIND_MAX controller and the TARGET_QPS loop
//! consume, detects queued seconds, and computes the end-of-run summary.
//!
//! ## Percentile semantics
//!
//! Cross-worker latency distributions are **not** recombined exactly in the
//! per-second series: a merged second's p-value is the slowest worker's
//! p-value for that bucket, and every windowed result carries
//! `slowest_worker_approximation = true` so downstream consumers can
//! correct. The end-of-run summary is computed from the raw
//! `QueryExecution` stream and is exact (`slowest_worker_approximation =
//! false` there).
//!
//! ## Queue detection
//!
//! A second is queued if the target-side queue-depth hint is positive, or if
//! QPS stalled (< 5% change vs. the previous second) while summed target
//! connections grew by ≥ 25%.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::BusError;
use crate::find_max::FindMaxReport;
use crate::stats::LatencyDigest;
use crate::types::{MetricSnapshot, Phase, QueryExecution, QueryKind, RunRecord};

/// One merged per-run second.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedSecond {
    pub bucket: u64,
    pub phase: Phase,
    pub workers_reporting: u32,
    /// Operations completed this second, summed across workers.
    pub qps: f64,
    pub errors: u64,
    pub active_connections: u32,
    pub target_connections: u32,
    /// Slowest-worker approximation.
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Summed backend queue-depth hints, if any worker reported one.
    pub queue_depth: Option<u64>,
    pub queued: bool,
}

/// Result of a windowed query. `available == false` means the window held no
/// complete seconds — callers must not treat the zeros as measurements.
#[derive(Debug, Clone, Serialize)]
pub struct WindowMetrics {
    pub available: bool,
    pub seconds: u64,
    pub qps: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate: f64,
    pub queued_fraction: f64,
    pub slowest_worker_approximation: bool,
}

impl WindowMetrics {
    fn unavailable() -> Self {
        WindowMetrics {
            available: false,
            seconds: 0,
            qps: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            error_rate: 0.0,
            queued_fraction: 0.0,
            slowest_worker_approximation: true,
        }
    }
}

/// Per-kind latency/count summary over the measurement phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSummary {
    pub kind: QueryKind,
    pub ops: u64,
    pub errors: u64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Per-phase op accounting, derived from the snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub ops: u64,
    pub errors: u64,
    pub error_rate: f64,
}

/// The single final aggregate row written when a run closes. Headline
/// numbers cover the measurement phase only — warmup-tagged executions are
/// excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub measurement_seconds: u64,
    pub total_ops: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub ops_per_sec: f64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub per_kind: Vec<KindSummary>,
    pub per_phase: Vec<PhaseSummary>,
    /// False: summary percentiles are computed from raw executions.
    pub slowest_worker_approximation: bool,
    pub find_max: Option<FindMaxReport>,
}

/// Merge raw snapshots into an ordered per-second series with queue flags.
pub fn merge_seconds(snapshots: &[MetricSnapshot]) -> Vec<AggregatedSecond> {
    let mut by_bucket: BTreeMap<u64, Vec<&MetricSnapshot>> = BTreeMap::new();
    for s in snapshots {
        by_bucket.entry(s.elapsed_seconds).or_default().push(s);
    }

    let mut series: Vec<AggregatedSecond> = by_bucket
        .into_iter()
        .map(|(bucket, rows)| {
            let mut agg = AggregatedSecond {
                bucket,
                phase: Phase::Warmup,
                workers_reporting: rows.len() as u32,
                qps: 0.0,
                errors: 0,
                active_connections: 0,
                target_connections: 0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                p99_ms: 0.0,
                queue_depth: None,
                queued: false,
            };
            for s in rows {
                agg.phase = agg.phase.max(s.phase);
                agg.qps += s.ops as f64;
                agg.errors += s.errors;
                agg.active_connections += s.active_connections;
                agg.target_connections += s.target_connections;
                agg.p50_ms = agg.p50_ms.max(s.p50_ms);
                agg.p95_ms = agg.p95_ms.max(s.p95_ms);
                agg.p99_ms = agg.p99_ms.max(s.p99_ms);
                if let Some(q) = s.queue_depth {
                    *agg.queue_depth.get_or_insert(0) += q;
                }
            }
            agg
        })
        .collect();

    detect_queueing(&mut series);
    series
}

fn detect_queueing(series: &mut [AggregatedSecond]) {
    for i in 0..series.len() {
        let hint_queued = series[i].queue_depth.map(|q| q > 0).unwrap_or(false);
        let stall_queued = if i > 0 {
            let prev = &series[i - 1];
            let qps_stalled =
                prev.qps > 0.0 && (series[i].qps - prev.qps).abs() < 0.05 * prev.qps;
            let target_grew = prev.target_connections > 0
                && series[i].target_connections as f64
                    >= prev.target_connections as f64 * 1.25;
            qps_stalled && target_grew
        } else {
            false
        };
        series[i].queued = hint_queued || stall_queued;
    }
}

/// Read-side aggregator over a run's metric streams.
#[derive(Debug)]
pub struct Aggregator {
    bus: Arc<dyn Bus>,
    run_id: Uuid,
}

impl Aggregator {
    pub fn new(bus: Arc<dyn Bus>, run_id: Uuid) -> Self {
        Aggregator { bus, run_id }
    }

    /// The full merged per-second series.
    pub fn per_second(&self) -> Result<Vec<AggregatedSecond>, BusError> {
        let snapshots = self.bus.snapshots(self.run_id, 0)?;
        Ok(merge_seconds(&snapshots))
    }

    /// Aggregated metrics over the last `window_seconds` complete seconds,
    /// restricted to MEASUREMENT and excluding the in-progress bucket
    /// (`now_bucket`).
    pub fn window(&self, window_seconds: u64, now_bucket: u64) -> Result<WindowMetrics, BusError> {
        let since = now_bucket.saturating_sub(window_seconds.saturating_add(2));
        let snapshots = self.bus.snapshots(self.run_id, since)?;
        let series = merge_seconds(&snapshots);

        let eligible: Vec<&AggregatedSecond> = series
            .iter()
            .filter(|s| s.phase == Phase::Measurement && s.bucket < now_bucket)
            .collect();
        let window: Vec<&AggregatedSecond> = eligible
            .iter()
            .rev()
            .take(window_seconds as usize)
            .rev()
            .copied()
            .collect();
        if window.is_empty() {
            return Ok(WindowMetrics::unavailable());
        }

        let seconds = window.len() as u64;
        let total_ops: f64 = window.iter().map(|s| s.qps).sum();
        let total_errors: u64 = window.iter().map(|s| s.errors).sum();
        let queued = window.iter().filter(|s| s.queued).count() as f64;

        // Ops-weighted mean of per-second (slowest-worker) percentiles.
        let weight = |f: fn(&AggregatedSecond) -> f64| -> f64 {
            if total_ops > 0.0 {
                window.iter().map(|s| f(s) * s.qps).sum::<f64>() / total_ops
            } else {
                0.0
            }
        };

        Ok(WindowMetrics {
            available: true,
            seconds,
            qps: total_ops / seconds as f64,
            p50_ms: weight(|s| s.p50_ms),
            p95_ms: weight(|s| s.p95_ms),
            p99_ms: weight(|s| s.p99_ms),
            error_rate: if total_ops > 0.0 {
                total_errors as f64 / total_ops
            } else {
                0.0
            },
            queued_fraction: queued / seconds as f64,
            slowest_worker_approximation: true,
        })
    }

    /// Compute the final aggregate row from the raw execution and snapshot
    /// streams. Warmup-tagged executions are excluded from the headline
    /// numbers.
    pub fn finalize(
        &self,
        run: &RunRecord,
        find_max: Option<FindMaxReport>,
    ) -> Result<RunSummary, BusError> {
        let executions = self.bus.executions(self.run_id)?;
        let snapshots = self.bus.snapshots(self.run_id, 0)?;

        let measured: Vec<&QueryExecution> = executions.iter().filter(|e| !e.warmup).collect();
        let total_ops = measured.len() as u64;
        let error_count = measured.iter().filter(|e| !e.success).count() as u64;
        let read_ops = measured.iter().filter(|e| e.kind.is_read()).count() as u64;

        let mut overall = LatencyDigest::new();
        let mut per_kind_digest: BTreeMap<QueryKind, (LatencyDigest, u64, u64)> = BTreeMap::new();
        for e in &measured {
            overall.record(e.elapsed_ms);
            let entry = per_kind_digest
                .entry(e.kind)
                .or_insert_with(|| (LatencyDigest::new(), 0, 0));
            entry.0.record(e.elapsed_ms);
            entry.1 += 1;
            if !e.success {
                entry.2 += 1;
            }
        }

        let per_kind = per_kind_digest
            .into_iter()
            .map(|(kind, (digest, ops, errors))| KindSummary {
                kind,
                ops,
                errors,
                p50_ms: digest.percentile(50.0),
                p90_ms: digest.percentile(90.0),
                p95_ms: digest.percentile(95.0),
                p99_ms: digest.percentile(99.0),
            })
            .collect();

        let mut per_phase_map: BTreeMap<Phase, (u64, u64)> = BTreeMap::new();
        for s in &snapshots {
            let entry = per_phase_map.entry(s.phase).or_insert((0, 0));
            entry.0 += s.ops;
            entry.1 += s.errors;
        }
        let per_phase = per_phase_map
            .into_iter()
            .map(|(phase, (ops, errors))| PhaseSummary {
                phase,
                ops,
                errors,
                error_rate: if ops > 0 { errors as f64 / ops as f64 } else { 0.0 },
            })
            .collect();

        // Actual measured wall time, from the first to the last non-warmup
        // start. Falls back to the configured duration for empty runs.
        let measurement_seconds = match (
            measured.iter().map(|e| e.start_time).min(),
            measured.iter().map(|e| e.start_time).max(),
        ) {
            (Some(first), Some(last)) => {
                ((last - first).num_milliseconds() as f64 / 1000.0).ceil().max(1.0) as u64
            }
            _ => run.scenario.duration_seconds,
        };

        Ok(RunSummary {
            run_id: self.run_id,
            measurement_seconds,
            total_ops,
            error_count,
            error_rate: if total_ops > 0 {
                error_count as f64 / total_ops as f64
            } else {
                0.0
            },
            ops_per_sec: total_ops as f64 / measurement_seconds.max(1) as f64,
            read_ops,
            write_ops: total_ops - read_ops,
            p50_ms: overall.percentile(50.0),
            p90_ms: overall.percentile(90.0),
            p95_ms: overall.percentile(95.0),
            p99_ms: overall.percentile(99.0),
            per_kind,
            per_phase,
            slowest_worker_approximation: false,
            find_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::scenario::test_scenario_placeholder;
    use chrono::Utc;

    fn snapshot(
        run_id: Uuid,
        worker: &str,
        bucket: u64,
        phase: Phase,
        ops: u64,
        errors: u64,
        p95: f64,
        target: u32,
        queue_depth: Option<u64>,
    ) -> MetricSnapshot {
        MetricSnapshot {
            run_id,
            worker_id: worker.into(),
            elapsed_seconds: bucket,
            phase,
            active_connections: target,
            target_connections: target,
            ops,
            errors,
            p50_ms: p95 / 2.0,
            p95_ms: p95,
            p99_ms: p95 * 1.5,
            ops_by_kind: Default::default(),
            queue_depth,
        }
    }

    fn seeded() -> (Arc<MemoryBus>, Uuid) {
        let bus = Arc::new(MemoryBus::new());
        let run_id = Uuid::new_v4();
        bus.create_run(&RunRecord::new(run_id, test_scenario_placeholder()))
            .unwrap();
        (bus, run_id)
    }

    // ── merge_seconds ─────────────────────────────────────────────

    #[test]
    fn merge_sums_qps_and_takes_slowest_percentile() {
        let run_id = Uuid::new_v4();
        let snaps = vec![
            snapshot(run_id, "w1", 3, Phase::Measurement, 100, 1, 10.0, 4, None),
            snapshot(run_id, "w2", 3, Phase::Measurement, 150, 0, 25.0, 4, None),
        ];
        let series = merge_seconds(&snaps);
        assert_eq!(series.len(), 1);
        let s = &series[0];
        assert_eq!(s.bucket, 3);
        assert_eq!(s.workers_reporting, 2);
        assert_eq!(s.qps, 250.0);
        assert_eq!(s.errors, 1);
        assert_eq!(s.p95_ms, 25.0, "slowest worker wins");
        assert_eq!(s.target_connections, 8);
    }

    #[test]
    fn merge_orders_buckets() {
        let run_id = Uuid::new_v4();
        let snaps = vec![
            snapshot(run_id, "w1", 5, Phase::Measurement, 10, 0, 1.0, 1, None),
            snapshot(run_id, "w1", 2, Phase::Measurement, 10, 0, 1.0, 1, None),
            snapshot(run_id, "w1", 9, Phase::Measurement, 10, 0, 1.0, 1, None),
        ];
        let buckets: Vec<u64> = merge_seconds(&snaps).iter().map(|s| s.bucket).collect();
        assert_eq!(buckets, vec![2, 5, 9]);
    }

    #[test]
    fn queue_detected_from_backend_hint() {
        let run_id = Uuid::new_v4();
        let snaps = vec![snapshot(
            run_id,
            "w1",
            0,
            Phase::Measurement,
            100,
            0,
            10.0,
            4,
            Some(3),
        )];
        let series = merge_seconds(&snaps);
        assert!(series[0].queued);
    }

    #[test]
    fn queue_detected_from_stalled_qps_and_grown_target() {
        let run_id = Uuid::new_v4();
        let snaps = vec![
            snapshot(run_id, "w1", 0, Phase::Measurement, 100, 0, 10.0, 8, None),
            // Target grew 8 → 16 (+100%) while QPS moved < 5%.
            snapshot(run_id, "w1", 1, Phase::Measurement, 102, 0, 10.0, 16, None),
        ];
        let series = merge_seconds(&snaps);
        assert!(!series[0].queued);
        assert!(series[1].queued);
    }

    #[test]
    fn no_queue_when_qps_scales_with_target() {
        let run_id = Uuid::new_v4();
        let snaps = vec![
            snapshot(run_id, "w1", 0, Phase::Measurement, 100, 0, 10.0, 8, None),
            snapshot(run_id, "w1", 1, Phase::Measurement, 190, 0, 10.0, 16, None),
        ];
        let series = merge_seconds(&snaps);
        assert!(!series[1].queued);
    }

    #[test]
    fn no_queue_when_target_held_constant() {
        let run_id = Uuid::new_v4();
        let snaps = vec![
            snapshot(run_id, "w1", 0, Phase::Measurement, 100, 0, 10.0, 8, None),
            snapshot(run_id, "w1", 1, Phase::Measurement, 101, 0, 10.0, 8, None),
        ];
        let series = merge_seconds(&snaps);
        assert!(!series[1].queued);
    }

    // ── windowed queries ─────────────────────────────────────────

    #[test]
    fn empty_window_reports_unavailable_not_zeros() {
        let (bus, run_id) = seeded();
        let agg = Aggregator::new(bus, run_id);
        let w = agg.window(5, 10).unwrap();
        assert!(!w.available);
        assert_eq!(w.seconds, 0);
    }

    #[test]
    fn window_excludes_in_progress_second_and_warmup() {
        let (bus, run_id) = seeded();
        // Warmup bucket, three measurement buckets, then the in-progress one.
        bus.append_snapshot(&snapshot(run_id, "w1", 0, Phase::Warmup, 500, 0, 5.0, 4, None))
            .unwrap();
        for bucket in 1..=3 {
            bus.append_snapshot(&snapshot(
                run_id,
                "w1",
                bucket,
                Phase::Measurement,
                100,
                0,
                10.0,
                4,
                None,
            ))
            .unwrap();
        }
        bus.append_snapshot(&snapshot(
            run_id,
            "w1",
            4,
            Phase::Measurement,
            9999,
            0,
            10.0,
            4,
            None,
        ))
        .unwrap();

        let agg = Aggregator::new(bus, run_id);
        let w = agg.window(10, 4).unwrap();
        assert!(w.available);
        assert_eq!(w.seconds, 3, "warmup and in-progress buckets excluded");
        assert_eq!(w.qps, 100.0);
    }

    #[test]
    fn window_takes_only_the_last_n_seconds() {
        let (bus, run_id) = seeded();
        for bucket in 0..10 {
            let ops = if bucket < 5 { 10 } else { 200 };
            bus.append_snapshot(&snapshot(
                run_id,
                "w1",
                bucket,
                Phase::Measurement,
                ops,
                0,
                10.0,
                4,
                None,
            ))
            .unwrap();
        }
        let agg = Aggregator::new(bus, run_id);
        let w = agg.window(3, 10).unwrap();
        assert_eq!(w.seconds, 3);
        assert_eq!(w.qps, 200.0, "only buckets 7..=9 included");
    }

    #[test]
    fn window_error_rate_and_queued_fraction() {
        let (bus, run_id) = seeded();
        for bucket in 0..4 {
            bus.append_snapshot(&snapshot(
                run_id,
                "w1",
                bucket,
                Phase::Measurement,
                100,
                10,
                10.0,
                4,
                if bucket >= 2 { Some(5) } else { None },
            ))
            .unwrap();
        }
        let agg = Aggregator::new(bus, run_id);
        let w = agg.window(4, 4).unwrap();
        assert!((w.error_rate - 0.1).abs() < 1e-9);
        assert!((w.queued_fraction - 0.5).abs() < 1e-9);
        assert!(w.slowest_worker_approximation);
    }

    // ── finalize ─────────────────────────────────────────────────

    fn execution(
        run_id: Uuid,
        kind: QueryKind,
        warmup: bool,
        success: bool,
        elapsed_ms: f64,
        offset_ms: i64,
    ) -> QueryExecution {
        QueryExecution {
            run_id,
            worker_id: "w1".into(),
            kind,
            start_time: Utc::now() + chrono::Duration::milliseconds(offset_ms),
            elapsed_ms,
            success,
            warmup,
            rows_returned: Some(1),
            error_class: None,
        }
    }

    #[test]
    fn finalize_excludes_warmup_from_headline_numbers() {
        let (bus, run_id) = seeded();
        let run = bus.get_run(run_id).unwrap().unwrap();
        let rows = vec![
            execution(run_id, QueryKind::PointLookup, true, true, 5.0, 0),
            execution(run_id, QueryKind::PointLookup, false, true, 10.0, 1000),
            execution(run_id, QueryKind::Insert, false, false, 20.0, 2000),
        ];
        bus.append_executions(&rows).unwrap();

        let agg = Aggregator::new(Arc::clone(&bus) as Arc<dyn Bus>, run_id);
        let summary = agg.finalize(&run, None).unwrap();
        assert_eq!(summary.total_ops, 2);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.read_ops, 1);
        assert_eq!(summary.write_ops, 1);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);
        assert!(!summary.slowest_worker_approximation);
        assert_eq!(summary.per_kind.len(), 2);
    }

    #[test]
    fn finalize_per_kind_percentiles_are_exact() {
        let (bus, run_id) = seeded();
        let run = bus.get_run(run_id).unwrap().unwrap();
        let rows: Vec<QueryExecution> = (1..=100)
            .map(|i| {
                execution(
                    run_id,
                    QueryKind::PointLookup,
                    false,
                    true,
                    i as f64,
                    i * 10,
                )
            })
            .collect();
        bus.append_executions(&rows).unwrap();

        let agg = Aggregator::new(Arc::clone(&bus) as Arc<dyn Bus>, run_id);
        let summary = agg.finalize(&run, None).unwrap();
        let kind = &summary.per_kind[0];
        assert_eq!(kind.ops, 100);
        assert_eq!(kind.p50_ms, 50.0);
        assert_eq!(kind.p95_ms, 95.0);
        assert_eq!(kind.p99_ms, 99.0);
    }

    #[test]
    fn finalize_empty_run_has_zero_ops_and_no_panic() {
        let (bus, run_id) = seeded();
        let run = bus.get_run(run_id).unwrap().unwrap();
        let agg = Aggregator::new(Arc::clone(&bus) as Arc<dyn Bus>, run_id);
        let summary = agg.finalize(&run, None).unwrap();
        assert_eq!(summary.total_ops, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert_eq!(summary.measurement_seconds, run.scenario.duration_seconds);
    }

    #[test]
    fn finalize_per_phase_comes_from_snapshots() {
        let (bus, run_id) = seeded();
        let run = bus.get_run(run_id).unwrap().unwrap();
        bus.append_snapshot(&snapshot(run_id, "w1", 0, Phase::Warmup, 50, 0, 5.0, 2, None))
            .unwrap();
        bus.append_snapshot(&snapshot(
            run_id,
            "w1",
            1,
            Phase::Measurement,
            100,
            2,
            5.0,
            2,
            None,
        ))
        .unwrap();

        let agg = Aggregator::new(Arc::clone(&bus) as Arc<dyn Bus>, run_id);
        let summary = agg.finalize(&run, None).unwrap();
        assert_eq!(summary.per_phase.len(), 2);
        let warm = summary
            .per_phase
            .iter()
            .find(|p| p.phase == Phase::Warmup)
            .unwrap();
        assert_eq!(warm.ops, 50);
        let meas = summary
            .per_phase
            .iter()
            .find(|p| p.phase == Phase::Measurement)
            .unwrap();
        assert_eq!(meas.errors, 2);
        assert!((meas.error_rate - 0.02).abs() < 1e-9);
    }
}
