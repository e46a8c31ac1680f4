//! # Metrics — Hardware Telemetry Collection
//!
//! Collects system-level hardware readings from each worker host using the
//! [`sysinfo`] crate. Readings ride along on heartbeat upserts so the
//! coordinator can see resource pressure next to throughput when deciding a
//! run's fate.
//!
//! | Metric | Source | Unit |
//! |--------|--------|------|
//! | CPU usage | `System::global_cpu_usage()` | percent (0–100 per core) |
//! | Memory used/total | `System::used_memory()` / `total_memory()` | GiB |
//! | Load averages | `System::load_average()` | 1m, 5m, 15m |
//!
//! The `sysinfo::System` instance is reused across heartbeat ticks (passed
//! by `&mut` reference) to amortize initialization cost.

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub memory_usage_percent: f32,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,
}

pub fn collect(sys: &System) -> HardwareMetrics {
    let cpu_usage = sys.global_cpu_usage();

    let mem_total = sys.total_memory() as f64;
    let mem_used = sys.used_memory() as f64;
    let mem_total_gb = mem_total / 1_073_741_824.0;
    let mem_used_gb = mem_used / 1_073_741_824.0;
    let mem_pct = if mem_total > 0.0 {
        (mem_used / mem_total * 100.0) as f32
    } else {
        0.0
    };

    let load = System::load_average();

    HardwareMetrics {
        cpu_usage_percent: cpu_usage,
        memory_used_gb: (mem_used_gb * 10.0).round() / 10.0,
        memory_total_gb: (mem_total_gb * 10.0).round() / 10.0,
        memory_usage_percent: (mem_pct * 10.0).round() / 10.0,
        load_avg_1m: (load.one * 100.0).round() / 100.0,
        load_avg_5m: (load.five * 100.0).round() / 100.0,
        load_avg_15m: (load.fifteen * 100.0).round() / 100.0,
    }
}
