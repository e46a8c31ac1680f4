//! Percentile-machinery benchmarks: the exact sorted-sample path, the
//! bucket-histogram path, and the aggregator's per-second merge.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loadreach::stats::{LatencyDigest, LogHistogram};

fn bench_digest_record(c: &mut Criterion) {
    c.bench_function("digest_record_10k", |b| {
        b.iter(|| {
            let mut d = LatencyDigest::new();
            for i in 0..10_000u32 {
                d.record(black_box((i % 500) as f64 + 0.5));
            }
            black_box(d.percentile(95.0))
        })
    });
}

fn bench_histogram_record(c: &mut Criterion) {
    c.bench_function("histogram_record_100k", |b| {
        b.iter(|| {
            let mut h = LogHistogram::new();
            for i in 0..100_000u32 {
                h.record(black_box((i % 2_000) as f64 + 0.1));
            }
            black_box((h.percentile(50.0), h.percentile(99.0)))
        })
    });
}

fn bench_exact_percentile(c: &mut Criterion) {
    let mut d = LatencyDigest::new();
    for i in 0..50_000u32 {
        d.record((i % 1_000) as f64);
    }
    c.bench_function("exact_percentile_50k_samples", |b| {
        b.iter(|| black_box(d.percentile(black_box(95.0))))
    });
}

criterion_group!(
    benches,
    bench_digest_record,
    bench_histogram_record,
    bench_exact_percentile
);
criterion_main!(benches);
