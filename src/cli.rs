//! # CLI — Command Implementations
//!
//! Bodies for the `run`, `stop`, `status`, and `worker` subcommands,
//! dispatched from `main.rs`. Exit codes follow the harness contract:
//!
//! | Command | Codes |
//! |---------|-------|
//! | `run` | 0 COMPLETED, 1 FAILED, 2 CANCELLED, 3 bad config |
//! | `stop` | 0 acknowledged, 4 run not found |
//! | `status` | 0 found (JSON on stdout), 4 not found |
//! | `worker` | 0 clean exit |
//!
//! ## Bus selection
//!
//! With `--database-url` (or `DATABASE_URL`), coordination goes through
//! PostgreSQL and distributed workers can join with `worker --run-id`.
//! Without it, `run` executes entirely in-process over the memory bus —
//! the coordinator plus `expected_workers` local worker threads.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

use loadreach::bus::{Bus, MemoryBus, PgBus};
use loadreach::coordinator::{Coordinator, CoordinatorTuning, RunOutcome, SubmitError};
use loadreach::db::Database;
use loadreach::error::ConfigError;
use loadreach::scenario::Scenario;
use loadreach::types::RunStatus;
use loadreach::worker::{Worker, WorkerConfig, WorkerTuning};

/// Exit code for rejected configuration.
const EXIT_BAD_CONFIG: i32 = 3;
/// Exit code for a run that does not exist.
const EXIT_NOT_FOUND: i32 = 4;

/// Connect to PostgreSQL and wrap it in a bus. The runtime must outlive the
/// bus, so both are returned together.
fn connect_pg_bus(database_url: &str) -> Result<(tokio::runtime::Runtime, Arc<dyn Bus>)> {
    let rt = tokio::runtime::Runtime::new()?;
    let db = rt
        .block_on(Database::connect(database_url))
        .with_context(|| {
            format!(
                "connecting to {}",
                loadreach::redact_database_url(database_url)
            )
        })?;
    rt.block_on(db.ensure_schema())?;
    let bus: Arc<dyn Bus> = Arc::new(PgBus::new(db, rt.handle().clone()));
    Ok((rt, bus))
}

fn load_scenario(path: &Path) -> Result<Scenario, ConfigError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
    Scenario::from_json(&json)
}

/// `run --scenario FILE [--run-id ID]`: admit, execute, wait for terminal
/// status.
pub fn run_benchmark(
    database_url: Option<&str>,
    scenario_path: &Path,
    run_id: Option<Uuid>,
    external_workers: bool,
) -> Result<i32> {
    let scenario = match load_scenario(scenario_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("scenario rejected: {e}");
            return Ok(EXIT_BAD_CONFIG);
        }
    };

    // The runtime must stay alive for the life of the run when coordination
    // goes through PostgreSQL.
    let (_rt, bus): (Option<tokio::runtime::Runtime>, Arc<dyn Bus>) = match database_url {
        Some(url) => {
            let (rt, bus) = connect_pg_bus(url)?;
            (Some(rt), bus)
        }
        None => (None, Arc::new(MemoryBus::new())),
    };

    let coordinator = match Coordinator::submit(
        Arc::clone(&bus),
        scenario.clone(),
        run_id,
        CoordinatorTuning::default(),
    ) {
        Ok(c) => c,
        Err(SubmitError::Config(e)) => {
            eprintln!("scenario rejected: {e}");
            return Ok(EXIT_BAD_CONFIG);
        }
        Err(SubmitError::Bus(e)) => return Err(e.into()),
    };
    let run_id = coordinator.run_id();
    println!("run_id: {run_id}");

    let mut worker_handles = Vec::new();
    if !external_workers {
        let adapter = loadreach::adapter::create(&scenario.target.adapter)
            .map_err(|e| anyhow!("adapter: {e}"))?;
        for i in 0..scenario.expected_workers {
            let worker = Worker::new(
                Arc::clone(&bus),
                Arc::clone(&adapter),
                WorkerConfig {
                    run_id,
                    worker_id: format!("{}-w{i}", loadreach::gethostname()),
                    scenario: scenario.clone(),
                    tuning: WorkerTuning::default(),
                },
            );
            worker_handles.push(thread::spawn(move || {
                if let Err(e) = worker.run() {
                    tracing::error!(error = %e, "worker exited with error");
                }
            }));
        }
    }

    let outcome = coordinator.run();
    for handle in worker_handles {
        let _ = handle.join();
    }

    print_outcome(&outcome);
    Ok(match outcome.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => 2,
        _ => 1,
    })
}

fn print_outcome(outcome: &RunOutcome) {
    let doc = serde_json::json!({
        "run_id": outcome.run_id,
        "status": outcome.status,
        "reason_code": outcome.reason_code,
        "reason_message": outcome.reason_message,
        "partial_results_available": outcome.partial_results_available,
        "summary": outcome.summary,
    });
    println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());

    // Human-readable one-liner next to the machine-readable document.
    if let Some(summary) = &outcome.summary {
        eprintln!(
            "[{}] measured {} ops, {:.1} ops/s, error rate {:.2}%",
            loadreach::format_hms(summary.measurement_seconds),
            summary.total_ops,
            summary.ops_per_sec,
            summary.error_rate * 100.0
        );
    }
}

/// `stop --run-id ID [--abort]`: set the one-shot request flag; the run's
/// coordinator converts it into STOP/ABORT control events.
pub fn stop_run(database_url: Option<&str>, run_id: Uuid, abort: bool) -> Result<i32> {
    let url = database_url
        .ok_or_else(|| anyhow!("stop requires --database-url (or DATABASE_URL) to reach the run"))?;
    let (_rt, bus) = connect_pg_bus(url)?;
    match bus.request_stop(run_id, abort) {
        Ok(()) => {
            println!(
                "{} requested for {run_id}",
                if abort { "abort" } else { "stop" }
            );
            Ok(0)
        }
        Err(loadreach::error::BusError::RunNotFound(_)) => {
            eprintln!("run {run_id} not found");
            Ok(EXIT_NOT_FOUND)
        }
        Err(e) => Err(e.into()),
    }
}

/// `status --run-id ID`: machine-readable run status on stdout.
pub fn run_status(database_url: Option<&str>, run_id: Uuid) -> Result<i32> {
    let url = database_url.ok_or_else(|| {
        anyhow!("status requires --database-url (or DATABASE_URL) to reach the run")
    })?;
    let (_rt, bus) = connect_pg_bus(url)?;
    let Some(run) = bus.get_run(run_id)? else {
        eprintln!("run {run_id} not found");
        return Ok(EXIT_NOT_FOUND);
    };
    let doc = serde_json::json!({
        "run_id": run.run_id,
        "status": run.status,
        "phase": run.phase,
        "start_time": run.start_time,
        "warmup_end_time": run.warmup_end_time,
        "end_time": run.end_time,
        "workers": {
            "expected": run.total_workers_expected,
            "registered": run.workers_registered,
            "active": run.workers_active,
            "completed": run.workers_completed,
        },
        "total_ops": run.total_ops,
        "error_count": run.error_count,
        "current_qps": run.current_qps,
        "find_max_state": run.find_max_state,
        "reason_code": run.reason_code,
        "reason_message": run.reason_message,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(0)
}

/// `worker --run-id ID [--worker-id ID]`: join a distributed run. The
/// scenario snapshot comes from the run row, so every worker executes the
/// same frozen configuration.
pub fn run_worker(
    database_url: Option<&str>,
    run_id: Uuid,
    worker_id: Option<String>,
) -> Result<i32> {
    let url = database_url
        .ok_or_else(|| anyhow!("worker requires --database-url (or DATABASE_URL) to join a run"))?;
    let (_rt, bus) = connect_pg_bus(url)?;
    let run = bus
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("run {run_id} not found"))?;
    if run.status.is_terminal() {
        return Err(anyhow!("run {run_id} already closed ({})", run.status));
    }

    let worker_id =
        worker_id.unwrap_or_else(|| format!("{}-{}", loadreach::gethostname(), std::process::id()));
    let adapter = loadreach::adapter::create(&run.scenario.target.adapter)
        .map_err(|e| anyhow!("adapter: {e}"))?;
    let worker = Worker::new(
        bus,
        adapter,
        WorkerConfig {
            run_id,
            worker_id,
            scenario: run.scenario,
            tuning: WorkerTuning::default(),
        },
    );
    let outcome = worker.run()?;
    println!(
        "worker done: {} queries, {} errors",
        outcome.queries_processed, outcome.error_count
    );
    Ok(0)
}
