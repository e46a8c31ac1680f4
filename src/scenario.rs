//! # Scenario — Benchmark Configuration Snapshot
//!
//! A scenario describes one benchmark run: the target, the operation mix,
//! the load mode, and the phase durations. Scenarios arrive as JSON, are
//! validated once at admission, and are then frozen onto the run row — the
//! snapshot never changes for the life of the run.
//!
//! ## Validation
//!
//! Admission is strict: unknown keys, a mix that does not sum to 100,
//! `target_concurrency = 0`, a missing operation template for a weighted
//! kind — all are rejected with a [`ConfigError`] before any run record is
//! created. The three load modes validate to an explicit sum type
//! ([`LoadProfile`]) so downstream code matches exhaustively instead of
//! probing optional fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::types::QueryKind;

/// Adapter selector plus connection parameters, passed through to the
/// adapter verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Registered adapter name, e.g. `"postgres"` or `"mock"`.
    pub adapter: String,
    /// Free-form adapter parameters (connection URL, mock latency model, ...).
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl TargetConfig {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| v.as_f64())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }
}

/// Concurrency bounds for the TARGET_QPS closed loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for ConcurrencyBounds {
    fn default() -> Self {
        ConcurrencyBounds { min: 1, max: 256 }
    }
}

/// Step-size policy for FIND_MAX.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Increment {
    /// Add `delta` connections per step.
    Linear { delta: u32 },
    /// Multiply by `factor` per step (rounded, always advances by ≥ 1).
    Geometric { factor: f64 },
}

/// Degradation thresholds for FIND_MAX step classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FindMaxThresholds {
    /// Fractional QPS drop vs. best that marks DEGRADED (e.g. 0.1 = 10%).
    pub qps_drop_pct: f64,
    /// Fractional p95 inflation vs. baseline that marks DEGRADED.
    pub p95_inflation_pct: f64,
    /// Error-rate ceiling that marks ERROR_THRESHOLD.
    pub error_rate_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindMaxConfig {
    pub start: u32,
    pub max: u32,
    pub increment: Increment,
    pub t_step_seconds: u64,
    pub t_warm_seconds: u64,
    pub thresholds: FindMaxThresholds,
}

/// The validated load-mode sum type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadProfile {
    FixedConcurrency {
        target_concurrency: u32,
    },
    TargetQps {
        target_qps: f64,
        bounds: ConcurrencyBounds,
    },
    FindMaxConcurrency {
        find_max: FindMaxConfig,
    },
}

impl LoadProfile {
    pub fn mode_str(&self) -> &'static str {
        match self {
            LoadProfile::FixedConcurrency { .. } => "FIXED_CONCURRENCY",
            LoadProfile::TargetQps { .. } => "TARGET_QPS",
            LoadProfile::FindMaxConcurrency { .. } => "FIND_MAX_CONCURRENCY",
        }
    }

    /// The per-worker concurrency target in force before any control event.
    pub fn initial_target(&self) -> u32 {
        match self {
            LoadProfile::FixedConcurrency { target_concurrency } => *target_concurrency,
            LoadProfile::TargetQps { bounds, .. } => bounds.min,
            LoadProfile::FindMaxConcurrency { find_max } => find_max.start,
        }
    }
}

/// How the workload mix is drawn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixMode {
    /// Independent Bernoulli draw per operation.
    #[default]
    Independent,
    /// Permuted 100-slot schedule hitting the percentages exactly.
    Exact,
}

/// How a bind source is sampled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Iterate in insertion order (wrapping), lock-free cursor.
    #[default]
    Deterministic,
    /// Uniform with replacement.
    Uniform,
}

/// Where bind values for a templated operation come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BindSource {
    /// Monotonic integer sequence starting at `start`.
    Sequence {
        start: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    /// Uniform integers in `[min, max]`.
    IntRange { min: i64, max: i64 },
    /// Explicit value list.
    Values {
        values: Vec<serde_json::Value>,
        #[serde(default)]
        sampling: Sampling,
    },
}

fn default_step() -> i64 {
    1
}

/// One templated operation: SQL with `$n` placeholders plus its bind source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationSpec {
    pub sql_template: String,
    #[serde(default)]
    pub bind_source: Option<BindSource>,
    /// Defaults to true for reads (POINT_LOOKUP, RANGE_SCAN).
    #[serde(default)]
    pub expects_rows: Option<bool>,
}

/// Validated, immutable scenario snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub template_id: String,
    pub target: TargetConfig,
    pub table: String,
    pub duration_seconds: u64,
    pub warmup_seconds: u64,
    pub cooldown_seconds: u64,
    pub load: LoadProfile,
    pub mix: BTreeMap<QueryKind, u32>,
    pub mix_mode: MixMode,
    pub operations: BTreeMap<QueryKind, OperationSpec>,
    pub expected_workers: u32,
    /// Sustained per-worker error rate that moves the worker to DRAINING.
    pub error_rate_threshold: f64,
}

// ── Raw (wire) form ─────────────────────────────────────────────

/// The flat on-disk shape. Load-mode-specific fields are optional here and
/// validated into [`LoadProfile`] at admission.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScenario {
    template_id: Option<String>,
    target: Option<TargetConfig>,
    table: Option<String>,
    duration_seconds: Option<u64>,
    #[serde(default)]
    warmup_seconds: u64,
    #[serde(default)]
    cooldown_seconds: u64,
    load_mode: Option<String>,
    target_concurrency: Option<u32>,
    target_qps: Option<f64>,
    concurrency_bounds: Option<ConcurrencyBounds>,
    find_max: Option<FindMaxConfig>,
    mix: Option<BTreeMap<QueryKind, u32>>,
    #[serde(default)]
    mix_mode: MixMode,
    operations: Option<BTreeMap<QueryKind, OperationSpec>>,
    #[serde(default = "default_expected_workers")]
    expected_workers: u32,
    #[serde(default = "default_error_rate_threshold")]
    error_rate_threshold: f64,
}

fn default_expected_workers() -> u32 {
    1
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Scenario {
    /// Parse and validate a JSON scenario document.
    pub fn from_json(json: &str) -> Result<Scenario, ConfigError> {
        let raw: RawScenario = serde_json::from_str(json).map_err(|e| {
            let msg = e.to_string();
            if let Some(rest) = msg.strip_prefix("unknown field `") {
                if let Some(end) = rest.find('`') {
                    return ConfigError::UnknownField(rest[..end].to_string());
                }
            }
            ConfigError::Parse(msg)
        })?;
        raw.validate()
    }

    /// Total configured run length across all phases, in seconds.
    pub fn total_seconds(&self) -> u64 {
        self.warmup_seconds + self.duration_seconds + self.cooldown_seconds
    }
}

impl RawScenario {
    fn validate(self) -> Result<Scenario, ConfigError> {
        let template_id = self
            .template_id
            .ok_or_else(|| ConfigError::MissingField("template_id".into()))?;
        let target = self
            .target
            .ok_or_else(|| ConfigError::MissingField("target".into()))?;
        let table = self
            .table
            .ok_or_else(|| ConfigError::MissingField("table".into()))?;
        let duration_seconds = self
            .duration_seconds
            .ok_or_else(|| ConfigError::MissingField("duration_seconds".into()))?;
        if duration_seconds == 0 {
            return Err(invalid("duration_seconds", "must be > 0"));
        }
        if target.adapter.is_empty() {
            return Err(ConfigError::MissingField("target.adapter".into()));
        }

        let load_mode = self
            .load_mode
            .ok_or_else(|| ConfigError::MissingField("load_mode".into()))?;
        let load = match load_mode.as_str() {
            "FIXED_CONCURRENCY" => {
                let target_concurrency = self
                    .target_concurrency
                    .ok_or_else(|| ConfigError::MissingField("target_concurrency".into()))?;
                if target_concurrency == 0 {
                    return Err(invalid("target_concurrency", "must be >= 1"));
                }
                LoadProfile::FixedConcurrency { target_concurrency }
            }
            "TARGET_QPS" => {
                let target_qps = self
                    .target_qps
                    .ok_or_else(|| ConfigError::MissingField("target_qps".into()))?;
                if !(target_qps > 0.0) {
                    return Err(invalid("target_qps", "must be > 0"));
                }
                let bounds = self.concurrency_bounds.unwrap_or_default();
                if bounds.min == 0 {
                    return Err(invalid("concurrency_bounds.min", "must be >= 1"));
                }
                if bounds.min > bounds.max {
                    return Err(invalid("concurrency_bounds", "min must be <= max"));
                }
                LoadProfile::TargetQps { target_qps, bounds }
            }
            "FIND_MAX_CONCURRENCY" => {
                let fm = self
                    .find_max
                    .ok_or_else(|| ConfigError::MissingField("find_max".into()))?;
                validate_find_max(&fm)?;
                LoadProfile::FindMaxConcurrency { find_max: fm }
            }
            other => {
                return Err(invalid(
                    "load_mode",
                    format!(
                        "unknown mode `{other}` (expected FIXED_CONCURRENCY, TARGET_QPS, or FIND_MAX_CONCURRENCY)"
                    ),
                ))
            }
        };

        let mix = self
            .mix
            .ok_or_else(|| ConfigError::MissingField("mix".into()))?;
        let total: u32 = mix.values().sum();
        if total != 100 {
            return Err(ConfigError::MixSum(total));
        }

        let operations = self
            .operations
            .ok_or_else(|| ConfigError::MissingField("operations".into()))?;
        for (kind, pct) in &mix {
            if *pct > 0 && !operations.contains_key(kind) {
                return Err(invalid(
                    "operations",
                    format!("kind {kind} has mix weight {pct}% but no operation template"),
                ));
            }
        }
        for (kind, op) in &operations {
            if op.sql_template.trim().is_empty() {
                return Err(invalid(
                    "operations",
                    format!("kind {kind} has an empty sql_template"),
                ));
            }
        }

        if self.expected_workers == 0 {
            return Err(invalid("expected_workers", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(invalid("error_rate_threshold", "must be in [0, 1]"));
        }

        Ok(Scenario {
            template_id,
            target,
            table,
            duration_seconds,
            warmup_seconds: self.warmup_seconds,
            cooldown_seconds: self.cooldown_seconds,
            load,
            mix,
            mix_mode: self.mix_mode,
            operations,
            expected_workers: self.expected_workers,
            error_rate_threshold: self.error_rate_threshold,
        })
    }
}

fn validate_find_max(fm: &FindMaxConfig) -> Result<(), ConfigError> {
    if fm.start == 0 {
        return Err(invalid("find_max.start", "must be >= 1"));
    }
    if fm.max < fm.start {
        return Err(invalid("find_max.max", "must be >= find_max.start"));
    }
    match fm.increment {
        Increment::Linear { delta } if delta == 0 => {
            return Err(invalid("find_max.increment.delta", "must be >= 1"));
        }
        Increment::Geometric { factor } if !(factor > 1.0) => {
            return Err(invalid("find_max.increment.factor", "must be > 1"));
        }
        _ => {}
    }
    if fm.t_step_seconds == 0 {
        return Err(invalid("find_max.t_step_seconds", "must be > 0"));
    }
    let t = &fm.thresholds;
    for (name, v) in [
        ("qps_drop_pct", t.qps_drop_pct),
        ("p95_inflation_pct", t.p95_inflation_pct),
        ("error_rate_pct", t.error_rate_pct),
    ] {
        if !(v > 0.0) {
            return Err(invalid(
                &format!("find_max.thresholds.{name}"),
                "must be > 0",
            ));
        }
    }
    Ok(())
}

/// Minimal valid scenario for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_scenario_placeholder() -> Scenario {
    Scenario::from_json(
        r#"{
            "template_id": "test",
            "target": {"adapter": "mock", "params": {"latency_ms": 1}},
            "table": "t",
            "duration_seconds": 5,
            "load_mode": "FIXED_CONCURRENCY",
            "target_concurrency": 2,
            "mix": {"POINT_LOOKUP": 100},
            "operations": {"POINT_LOOKUP": {"sql_template": "SELECT 1"}}
        }"#,
    )
    .expect("placeholder scenario is valid")
}
