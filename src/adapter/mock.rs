//! # Mock Adapter — Deterministic Target Model
//!
//! Simulates a database whose service time is a function of in-flight
//! concurrency, so FIND_MAX ladders and TARGET_QPS loops can be exercised
//! without a real backend. All executors opened from one adapter instance
//! share a single active-connection gauge, which is what makes the
//! saturation model global within a process.
//!
//! ## Parameters (`target.params`)
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `latency_ms` | 10.0 | base service time per operation |
//! | `saturation_concurrency` | none | knee beyond which latency grows |
//! | `saturation_exponent` | 1.0 | latency multiplier is `(active/knee)^exp` |
//! | `fail_rate` | 0.0 | independent probability an operation fails |
//! | `rows_returned` | 1 | rows reported for `expects_rows` operations |
//!
//! With a knee `k`, throughput at concurrency `c > k` follows
//! `qps = c / (latency · (c/k)^exp)`: flat for `exp = 1`, declining for
//! `exp > 1`. Beyond the knee the adapter also reports a queue depth of
//! `active − knee` through `server_timings`.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CancelHandle, Connection, Operation, OpResult, ServerTimings, TargetAdapter};
use crate::error::AdapterError;
use crate::scenario::TargetConfig;
use crate::types::ErrorClass;

/// Granularity of the simulated service-time sleep. Small enough that
/// cancellation lands promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
struct MockProfile {
    latency_ms: f64,
    saturation_concurrency: Option<u64>,
    saturation_exponent: f64,
    fail_rate: f64,
    rows_returned: u64,
}

impl MockProfile {
    fn from_target(target: &TargetConfig) -> Result<MockProfile, AdapterError> {
        let latency_ms = target.param_f64("latency_ms").unwrap_or(10.0);
        if latency_ms < 0.0 {
            return Err(AdapterError::Config("latency_ms must be >= 0".into()));
        }
        let fail_rate = target.param_f64("fail_rate").unwrap_or(0.0);
        if !(0.0..=1.0).contains(&fail_rate) {
            return Err(AdapterError::Config("fail_rate must be in [0, 1]".into()));
        }
        Ok(MockProfile {
            latency_ms,
            saturation_concurrency: target.param_u64("saturation_concurrency"),
            saturation_exponent: target.param_f64("saturation_exponent").unwrap_or(1.0),
            fail_rate,
            rows_returned: target.param_u64("rows_returned").unwrap_or(1),
        })
    }
}

pub struct MockAdapter {
    active: Arc<AtomicU64>,
}

impl MockAdapter {
    pub fn new() -> Self {
        MockAdapter {
            active: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Currently executing operations across every connection opened from
    /// this adapter instance.
    pub fn active_operations(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self, target: &TargetConfig) -> Result<Box<dyn Connection>, AdapterError> {
        let profile = MockProfile::from_target(target)?;
        if target.param_str("refuse_connections") == Some("true") {
            return Err(AdapterError::Connect("mock target refusing connections".into()));
        }
        Ok(Box::new(MockConnection {
            profile,
            active: Arc::clone(&self.active),
            cancelled: Arc::new(MockCancel {
                flag: AtomicBool::new(false),
            }),
            closed: false,
            last_queue_depth: None,
        }))
    }
}

struct MockCancel {
    flag: AtomicBool,
}

impl CancelHandle for MockCancel {
    fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

struct MockConnection {
    profile: MockProfile,
    active: Arc<AtomicU64>,
    cancelled: Arc<MockCancel>,
    closed: bool,
    last_queue_depth: Option<u64>,
}

impl MockConnection {
    fn effective_latency(&self, active_now: u64) -> f64 {
        let base = self.profile.latency_ms;
        match self.profile.saturation_concurrency {
            Some(knee) if knee > 0 && active_now > knee => {
                base * (active_now as f64 / knee as f64).powf(self.profile.saturation_exponent)
            }
            _ => base,
        }
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, op: &Operation) -> OpResult {
        let started = Instant::now();
        if self.closed {
            return OpResult::failed(0.0, ErrorClass::Transport, "connection closed");
        }

        let active_now = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        let latency = self.effective_latency(active_now);
        self.last_queue_depth = match self.profile.saturation_concurrency {
            Some(knee) if active_now > knee => Some(active_now - knee),
            Some(_) => Some(0),
            None => None,
        };

        // Sleep in slices so an ABORT-driven cancel lands mid-operation.
        let deadline = started + Duration::from_secs_f64(latency / 1000.0);
        let mut was_cancelled = false;
        while Instant::now() < deadline {
            if self.cancelled.flag.load(Ordering::Relaxed) {
                was_cancelled = true;
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
        self.active.fetch_sub(1, Ordering::Relaxed);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if was_cancelled {
            return OpResult::failed(elapsed_ms, ErrorClass::Cancelled, "operation cancelled");
        }
        if self.profile.fail_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.profile.fail_rate
        {
            return OpResult::failed(elapsed_ms, ErrorClass::Execution, "injected failure");
        }
        let rows = op.expects_rows.then_some(self.profile.rows_returned);
        OpResult::ok(elapsed_ms, rows)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_dead(&self) -> bool {
        self.closed
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        Some(self.cancelled.clone())
    }

    fn server_timings(&self) -> Option<ServerTimings> {
        Some(ServerTimings {
            server_elapsed_ms: None,
            queue_depth: self.last_queue_depth,
        })
    }
}
