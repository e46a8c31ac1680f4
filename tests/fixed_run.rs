//! End-to-end runs in FIXED_CONCURRENCY mode over the memory bus: full
//! lifecycle, warmup tagging, mix distribution, user stop, and the run-close
//! invariants (single summary row, monotonic control events, heartbeat
//! accounting).

mod common;

use common::{launch, BUCKET};
use loadreach::bus::Bus;
use loadreach::types::{QueryKind, RunStatus, WorkerStatus};
use std::thread;
use std::time::Duration;

fn fixed_scenario(warmup: u64, duration: u64, concurrency: u32, latency_ms: u64) -> String {
    format!(
        r#"{{
            "template_id": "fixed-e2e",
            "target": {{"adapter": "mock", "params": {{"latency_ms": {latency_ms}}}}},
            "table": "accounts",
            "duration_seconds": {duration},
            "warmup_seconds": {warmup},
            "load_mode": "FIXED_CONCURRENCY",
            "target_concurrency": {concurrency},
            "mix": {{"POINT_LOOKUP": 100}},
            "operations": {{
                "POINT_LOOKUP": {{"sql_template": "SELECT * FROM accounts WHERE id = $1",
                                  "bind_source": {{"sequence": {{"start": 1}}}}}}
            }}
        }}"#
    )
}

/// S1: warmup then measurement at constant concurrency; the run completes on
/// schedule with plausible throughput and the warmup boundary respected.
#[test]
fn fixed_run_completes_with_expected_throughput() {
    // 5 logical seconds warmup, 10 measurement, 4 connections, 10 ms ops.
    let launched = launch(&fixed_scenario(5, 10, 4, 10), 1);
    let bus = std::sync::Arc::clone(&launched.bus);
    let run_id = launched.run_id;
    let outcome = launched.wait();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.reason_code.is_none());
    assert!(outcome.partial_results_available);

    let summary = outcome.summary.expect("summary written");
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.error_rate, 0.0);
    // 4 executors × one 10 ms op at a time for ~1 s of compressed
    // measurement ≈ 400 ops; allow generous scheduling slack.
    assert!(
        summary.total_ops > 150,
        "only {} measured ops",
        summary.total_ops
    );
    assert!(summary.p50_ms >= 10.0, "p50 {} below service time", summary.p50_ms);

    // Warmup-tagged executions exist and are excluded from the headline.
    let executions = bus.executions(run_id).unwrap();
    let warmup_ops = executions.iter().filter(|e| e.warmup).count() as u64;
    assert!(warmup_ops > 0, "no warmup-tagged executions");
    assert_eq!(summary.total_ops, executions.len() as u64 - warmup_ops);

    // Run row is terminal with timestamps in order.
    let run = bus.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let start = run.start_time.unwrap();
    let warmup_end = run.warmup_end_time.unwrap();
    let end = run.end_time.unwrap();
    assert!(start <= warmup_end && warmup_end <= end);
}

/// Universal invariants at run close: control-event sequence strictly
/// monotonic, exactly one summary, no STARTING heartbeat, executions match
/// the workers' own counts.
#[test]
fn run_close_invariants_hold() {
    let launched = launch(&fixed_scenario(0, 6, 2, 5), 1);
    let bus = std::sync::Arc::clone(&launched.bus);
    let run_id = launched.run_id;
    let outcome = launched.wait();
    assert_eq!(outcome.status, RunStatus::Completed);

    // Property 1: strictly monotonic sequence ids.
    let events = bus.events_since(run_id, 0).unwrap();
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(
            pair[1].sequence_id > pair[0].sequence_id,
            "sequence regression: {} then {}",
            pair[0].sequence_id,
            pair[1].sequence_id
        );
    }

    // Property 4: one final aggregate, no STARTING heartbeats.
    assert!(bus.get_summary(run_id).unwrap().is_some());
    let heartbeats = bus.heartbeats(run_id).unwrap();
    assert!(heartbeats
        .iter()
        .all(|h| h.status != WorkerStatus::Starting));
    assert_eq!(heartbeats[0].status, WorkerStatus::Completed);

    // Property 3: persisted executions equal the sum of worker counts.
    let processed: u64 = heartbeats.iter().map(|h| h.queries_processed).sum();
    assert_eq!(bus.execution_count(run_id).unwrap(), processed);
}

/// S2: a 50/50 mix lands within ±10 percentage points over a large sample,
/// with per-kind summaries for both kinds.
#[test]
fn mixed_workload_splits_by_weight() {
    let json = fixed_scenario(0, 10, 4, 2)
        .replace(
            r#""mix": {"POINT_LOOKUP": 100}"#,
            r#""mix": {"POINT_LOOKUP": 50, "INSERT": 50}"#,
        )
        .replace(
            r#""operations": {"#,
            r#""operations": {
                "INSERT": {"sql_template": "INSERT INTO accounts (id) VALUES ($1)",
                           "bind_source": {"sequence": {"start": 1000}}},"#,
        );
    let launched = launch(&json, 1);
    let bus = std::sync::Arc::clone(&launched.bus);
    let run_id = launched.run_id;
    let outcome = launched.wait();
    assert_eq!(outcome.status, RunStatus::Completed);

    let executions = bus.executions(run_id).unwrap();
    assert!(
        executions.len() >= 1000,
        "sample too small for the tolerance check: {}",
        executions.len()
    );
    let lookups = executions
        .iter()
        .filter(|e| e.kind == QueryKind::PointLookup)
        .count() as f64;
    let fraction = lookups / executions.len() as f64;
    assert!(
        (0.40..=0.60).contains(&fraction),
        "mix drifted to {fraction:.3}"
    );

    let summary = outcome.summary.unwrap();
    assert_eq!(summary.per_kind.len(), 2);
    assert!(summary.read_ops > 0 && summary.write_ops > 0);
}

/// S5: a user stop lands mid-run; no operation starts after the workers
/// observe it, in-flight work drains, and the run still closes COMPLETED.
#[test]
fn user_stop_drains_and_completes() {
    let launched = launch(&fixed_scenario(0, 600, 3, 10), 1);
    let bus = std::sync::Arc::clone(&launched.bus);
    let run_id = launched.run_id;

    // Let it run ~5 logical seconds, then stop. Send it twice: a duplicate
    // request must not change the terminal state (property 7).
    thread::sleep(BUCKET * 5);
    let stop_time = chrono::Utc::now();
    bus.request_stop(run_id, false).unwrap();
    bus.request_stop(run_id, false).unwrap();

    let outcome = launched.wait();
    assert_eq!(outcome.status, RunStatus::Completed);

    let run = bus.get_run(run_id).unwrap().unwrap();
    let end = run.end_time.unwrap();
    assert!(
        end - stop_time < chrono::Duration::seconds(12),
        "end_time not within stop grace of the stop request"
    );

    // No operation starts once the stop has propagated (one control-poll
    // interval of slack on top of the request time).
    let latest_start = bus
        .executions(run_id)
        .unwrap()
        .iter()
        .map(|e| e.start_time)
        .max()
        .unwrap();
    assert!(
        latest_start - stop_time < chrono::Duration::seconds(1),
        "operation started {}ms after stop",
        (latest_start - stop_time).num_milliseconds()
    );
}

/// ABORT cancels in-flight operations instead of waiting them out, and the
/// run closes CANCELLED with partial results.
#[test]
fn user_abort_cancels_and_closes_cancelled() {
    // 30-logical-second operations: a drain would never finish in test time.
    let launched = launch(&fixed_scenario(0, 600, 2, 30_000), 1);
    let bus = std::sync::Arc::clone(&launched.bus);
    let run_id = launched.run_id;

    thread::sleep(Duration::from_millis(600));
    bus.request_stop(run_id, true).unwrap();
    let outcome = launched.wait();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.reason_code.as_deref(), Some("USER_ABORT"));
    assert!(outcome.partial_results_available);

    let cancelled = bus
        .executions(run_id)
        .unwrap()
        .iter()
        .filter(|e| e.error_class == Some(loadreach::types::ErrorClass::Cancelled))
        .count();
    assert!(cancelled >= 1, "no cancelled executions recorded");
}
