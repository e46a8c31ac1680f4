//! # Stats — Latency Percentile Estimation
//!
//! Numeric machinery for the metrics aggregator. Two regimes:
//!
//! - **Exact**: below [`SORTED_SAMPLE_LIMIT`] samples, percentiles come from
//!   a sorted copy of the raw samples (nearest-rank).
//! - **Approximate**: at or above the limit, samples spill into a fixed-ratio
//!   bucket histogram whose geometric bucket width bounds relative error at
//!   ≤ 2%.
//!
//! The switch is transparent to callers: [`LatencyDigest::record`] and
//! [`LatencyDigest::percentile`] behave identically in both regimes.

use serde::{Deserialize, Serialize};

/// Sample count at which the digest switches from exact sorted-sample
/// percentiles to the bucket histogram.
pub const SORTED_SAMPLE_LIMIT: usize = 100_000;

/// Bucket growth ratio. Relative error of a bucket midpoint is at most
/// (ratio − 1) / 2 = 2%.
const BUCKET_RATIO: f64 = 1.04;

/// Smallest resolvable latency, in milliseconds. Anything faster lands in
/// bucket zero.
const MIN_LATENCY_MS: f64 = 0.01;

/// Nearest-rank percentile over an already-sorted slice. `p` in [0, 100].
/// Returns 0.0 for an empty slice; callers guard on emptiness where "no
/// data" must be distinguishable from "zero latency".
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Fixed-ratio bucket histogram for latency values in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogHistogram {
    buckets: Vec<u64>,
    count: u64,
}

impl LogHistogram {
    pub fn new() -> Self {
        // ln(10^7 / 0.01) / ln(1.04) ≈ 528 buckets covers 10 µs .. ~3 hours.
        LogHistogram {
            buckets: vec![0; 530],
            count: 0,
        }
    }

    fn bucket_index(value_ms: f64) -> usize {
        if value_ms <= MIN_LATENCY_MS {
            return 0;
        }
        let idx = ((value_ms / MIN_LATENCY_MS).ln() / BUCKET_RATIO.ln()).floor() as usize + 1;
        idx.min(529)
    }

    /// Geometric midpoint of a bucket, the representative value reported for
    /// samples that landed there.
    fn bucket_value(index: usize) -> f64 {
        if index == 0 {
            return MIN_LATENCY_MS;
        }
        MIN_LATENCY_MS * BUCKET_RATIO.powf(index as f64 - 0.5)
    }

    pub fn record(&mut self, value_ms: f64) {
        self.buckets[Self::bucket_index(value_ms)] += 1;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * self.count as f64).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (i, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return Self::bucket_value(i);
            }
        }
        Self::bucket_value(529)
    }
}

impl Default for LogHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency collector with automatic exact→approximate switchover.
#[derive(Debug, Clone, Default)]
pub struct LatencyDigest {
    samples: Vec<f64>,
    histogram: Option<LogHistogram>,
}

impl LatencyDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value_ms: f64) {
        if let Some(h) = self.histogram.as_mut() {
            h.record(value_ms);
            return;
        }
        self.samples.push(value_ms);
        if self.samples.len() >= SORTED_SAMPLE_LIMIT {
            let mut h = LogHistogram::new();
            for &s in &self.samples {
                h.record(s);
            }
            self.samples = Vec::new();
            self.histogram = Some(h);
        }
    }

    pub fn count(&self) -> u64 {
        match &self.histogram {
            Some(h) => h.count(),
            None => self.samples.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// `p` in [0, 100]. Exact below the sample limit, ≤ 2% relative error
    /// above it.
    pub fn percentile(&self, p: f64) -> f64 {
        match &self.histogram {
            Some(h) => h.percentile(p),
            None => {
                let mut sorted = self.samples.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                percentile_sorted(&sorted, p)
            }
        }
    }

    /// p50/p95/p99 in one pass over the sorted samples.
    pub fn quantile_triple(&self) -> (f64, f64, f64) {
        match &self.histogram {
            Some(h) => (h.percentile(50.0), h.percentile(95.0), h.percentile(99.0)),
            None => {
                let mut sorted = self.samples.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                (
                    percentile_sorted(&sorted, 50.0),
                    percentile_sorted(&sorted, 95.0),
                    percentile_sorted(&sorted, 99.0),
                )
            }
        }
    }
}
