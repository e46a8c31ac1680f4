//! Shared harness for the end-to-end suites: compressed timing knobs and a
//! launcher that wires a coordinator plus N in-process workers over the
//! memory bus, exactly the way the CLI does for single-process runs — just
//! 10× faster (one logical "second" is a 100 ms bucket).

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

use loadreach::adapter;
use loadreach::bus::{Bus, MemoryBus};
use loadreach::coordinator::{Coordinator, CoordinatorTuning, RunOutcome};
use loadreach::scenario::Scenario;
use loadreach::worker::{Worker, WorkerConfig, WorkerTuning};

/// One logical scenario second, compressed.
pub const BUCKET: Duration = Duration::from_millis(100);

pub fn fast_coordinator_tuning() -> CoordinatorTuning {
    CoordinatorTuning {
        tick_interval: Duration::from_millis(20),
        registration_grace: Duration::from_secs(5),
        liveness_timeout: Duration::from_millis(900),
        max_dead_fraction: 0.5,
        stop_grace: Duration::from_secs(10),
        abort_grace: Duration::from_secs(3),
        bus_failure_grace: Duration::from_secs(5),
        qps_window_seconds: 3,
        qps_error_band: 0.05,
        qps_max_step: 4,
        bucket_seconds: BUCKET.as_secs_f64(),
    }
}

pub fn fast_worker_tuning() -> WorkerTuning {
    WorkerTuning {
        control_poll_interval: Duration::from_millis(20),
        heartbeat_interval: BUCKET,
        stop_grace: Duration::from_secs(10),
        abort_grace: Duration::from_secs(3),
        liveness_timeout: Duration::from_millis(900),
        bus_failure_grace: Duration::from_secs(5),
        execution_batch_max: 10_000,
        collect_hardware: false,
        sustained_error_intervals: 3,
    }
}

pub struct Launched {
    pub bus: Arc<MemoryBus>,
    pub run_id: Uuid,
    coordinator: Option<thread::JoinHandle<RunOutcome>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Launched {
    /// Block until the coordinator and all workers exit.
    pub fn wait(mut self) -> RunOutcome {
        let outcome = self
            .coordinator
            .take()
            .expect("coordinator handle")
            .join()
            .expect("coordinator thread panicked");
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        outcome
    }
}

/// Launch a run with `worker_count` in-process workers. The scenario's
/// `expected_workers` governs registration; spawning fewer lets tests
/// exercise registration timeouts and worker-death paths.
pub fn launch(scenario_json: &str, worker_count: u32) -> Launched {
    let bus = Arc::new(MemoryBus::new());
    let scenario = Scenario::from_json(scenario_json).expect("test scenario is valid");

    let coordinator = Coordinator::submit(
        Arc::clone(&bus) as Arc<dyn Bus>,
        scenario.clone(),
        None,
        fast_coordinator_tuning(),
    )
    .expect("admission");
    let run_id = coordinator.run_id();

    let adapter = adapter::create(&scenario.target.adapter).expect("adapter");
    let mut workers = Vec::new();
    for i in 0..worker_count {
        let worker = Worker::new(
            Arc::clone(&bus) as Arc<dyn Bus>,
            Arc::clone(&adapter),
            WorkerConfig {
                run_id,
                worker_id: format!("w{i}"),
                scenario: scenario.clone(),
                tuning: fast_worker_tuning(),
            },
        );
        workers.push(thread::spawn(move || {
            let _ = worker.run();
        }));
    }

    let coordinator = thread::spawn(move || coordinator.run());
    Launched {
        bus,
        run_id,
        coordinator: Some(coordinator),
        workers,
    }
}
