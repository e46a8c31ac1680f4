//! # Value Pool — Bind Values for Templated Operations
//!
//! A value pool supplies bind tuples for the parameterized operations in a
//! scenario. Pools are materialized once per run and shared read-only across
//! every worker and executor; `next()` must be callable from any executor
//! thread without blocking in the common path, so deterministic sources
//! advance a lock-free atomic cursor and sampled sources draw from a
//! thread-local RNG.
//!
//! ## Sources
//!
//! | Source | Draw | `size()` |
//! |--------|------|----------|
//! | `sequence` | insertion order (start, start+step, ...) | -1 (computed) |
//! | `int_range` | uniform with replacement | -1 (unbounded) |
//! | `values` (deterministic) | insertion order, wrapping | list length |
//! | `values` (uniform) | uniform with replacement | list length |

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::scenario::{BindSource, Sampling, Scenario};
use crate::types::QueryKind;

/// One bind value, typed so adapters can substitute it safely.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl BindValue {
    fn from_json(v: &serde_json::Value) -> BindValue {
        match v {
            serde_json::Value::Null => BindValue::Null,
            serde_json::Value::Bool(b) => BindValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    BindValue::Int(i)
                } else {
                    BindValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => BindValue::Text(s.clone()),
            // Arrays/objects are flattened by the caller; a nested composite
            // here is rendered as its JSON text.
            other => BindValue::Text(other.to_string()),
        }
    }
}

enum Source {
    Sequence {
        start: i64,
        step: i64,
        cursor: AtomicU64,
    },
    IntRange {
        min: i64,
        max: i64,
    },
    List {
        tuples: Vec<Vec<BindValue>>,
        sampling: Sampling,
        cursor: AtomicUsize,
    },
    /// Operation takes no binds.
    Empty,
}

/// Read-only pool shared across workers via `Arc`.
pub struct ValuePool {
    sources: BTreeMap<QueryKind, Source>,
}

impl ValuePool {
    /// Materialize the pools for every operation in the scenario.
    pub fn from_scenario(scenario: &Scenario) -> ValuePool {
        let mut sources = BTreeMap::new();
        for (kind, op) in &scenario.operations {
            let source = match &op.bind_source {
                None => Source::Empty,
                Some(BindSource::Sequence { start, step }) => Source::Sequence {
                    start: *start,
                    step: *step,
                    cursor: AtomicU64::new(0),
                },
                Some(BindSource::IntRange { min, max }) => {
                    let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
                    Source::IntRange { min: lo, max: hi }
                }
                Some(BindSource::Values { values, sampling }) => {
                    let tuples = values
                        .iter()
                        .map(|v| match v {
                            serde_json::Value::Array(items) => {
                                items.iter().map(BindValue::from_json).collect()
                            }
                            scalar => vec![BindValue::from_json(scalar)],
                        })
                        .collect();
                    Source::List {
                        tuples,
                        sampling: *sampling,
                        cursor: AtomicUsize::new(0),
                    }
                }
            };
            sources.insert(*kind, source);
        }
        ValuePool { sources }
    }

    /// Next bind tuple for `kind`. Kinds without a configured source yield an
    /// empty tuple.
    pub fn next(&self, kind: QueryKind) -> Vec<BindValue> {
        let Some(source) = self.sources.get(&kind) else {
            return Vec::new();
        };
        match source {
            Source::Empty => Vec::new(),
            Source::Sequence { start, step, cursor } => {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                vec![BindValue::Int(start.wrapping_add(step.wrapping_mul(i as i64)))]
            }
            Source::IntRange { min, max } => {
                let v = rand::thread_rng().gen_range(*min..=*max);
                vec![BindValue::Int(v)]
            }
            Source::List {
                tuples,
                sampling,
                cursor,
            } => {
                if tuples.is_empty() {
                    return Vec::new();
                }
                let idx = match sampling {
                    Sampling::Deterministic => {
                        cursor.fetch_add(1, Ordering::Relaxed) % tuples.len()
                    }
                    Sampling::Uniform => rand::thread_rng().gen_range(0..tuples.len()),
                };
                tuples[idx].clone()
            }
        }
    }

    /// Number of distinct tuples, or -1 for unbounded/computed sources.
    pub fn size(&self, kind: QueryKind) -> i64 {
        match self.sources.get(&kind) {
            None | Some(Source::Empty) => 0,
            Some(Source::Sequence { .. }) | Some(Source::IntRange { .. }) => -1,
            Some(Source::List { tuples, .. }) => tuples.len() as i64,
        }
    }
}
