//! approxagg Sampling Benchmarks
//!
//! Measures the cost of a sampling pass and of a full error-bound query.
//!
//! Run with: cargo bench
//! Run specific benchmark: cargo bench -- <name>

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use approxagg::extract::FilterExtract;
use approxagg::sampler::{PartitionSampler, PartitionSampling};
use approxagg::{approximate_sum, EngineConfig, MemorySource, PartitionId, PartitionSource, QuerySpec};

/// Generate `num_lines` event lines, a quarter of them filtered out.
fn create_events(num_lines: usize) -> Vec<String> {
    (0..num_lines)
        .map(|i| {
            let kind = if i % 4 == 3 { "WatchEvent" } else { "PushEvent" };
            format!(
                r#"{{"id":"{}","type":"{}","actor":{{"login":"user{}"}},"payload":{{"size":{}}}}}"#,
                i,
                kind,
                i % 97,
                1 + (i * 31) % 50
            )
        })
        .collect()
}

// ============================================================================
// Admission Benchmarks
// ============================================================================

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    let records = 100_000u64;
    group.throughput(Throughput::Elements(records));

    for (name, mode) in [
        ("ratio_0.1", PartitionSampling::Ratio(0.1)),
        ("ratio_1.0", PartitionSampling::Ratio(1.0)),
        ("fixed_1000", PartitionSampling::FixedSize(1000)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut sampler = PartitionSampler::new(7, PartitionId::new(0), mode);
                for i in 0..records {
                    black_box(sampler.admit((records - i) as f64));
                }
                sampler.admitted()
            })
        });
    }

    group.finish();
}

// ============================================================================
// Filter Benchmarks
// ============================================================================

fn bench_extract(c: &mut Criterion) {
    let lines = create_events(10_000);
    let spec = QuerySpec::builder("bench").build().unwrap();
    let extract = FilterExtract::from_spec(&spec);

    let mut group = c.benchmark_group("extract");
    group.throughput(Throughput::Elements(lines.len() as u64));
    group.bench_function("decode_and_filter", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(extract.process(line.as_bytes()));
            }
        })
    });
    group.finish();
}

// ============================================================================
// Query Benchmarks
// ============================================================================

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for size in [10_000usize, 100_000].iter() {
        let source = MemorySource::from_lines("bench", create_events(*size), size / 8);
        let config = EngineConfig::new().with_pilot_sample_size(500);
        group.throughput(Throughput::Elements(*size as u64));

        let ratio = QuerySpec::builder(source.location()).ratio(0.1).build().unwrap();
        group.bench_with_input(BenchmarkId::new("ratio_0.1", size), size, |b, _| {
            b.iter(|| black_box(approximate_sum(config.clone(), &source, &ratio).unwrap()))
        });

        let full = QuerySpec::builder(source.location()).build().unwrap();
        group.bench_with_input(BenchmarkId::new("full", size), size, |b, _| {
            b.iter(|| black_box(approximate_sum(config.clone(), &source, &full).unwrap()))
        });

        let bounded = QuerySpec::builder(source.location())
            .error_bound(0.05, 0.95)
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("error_bound_5pct", size), size, |b, _| {
            b.iter(|| black_box(approximate_sum(config.clone(), &source, &bounded).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(20)
        .measurement_time(std::time::Duration::from_secs(5));
    targets =
        bench_admission,
        bench_extract,
        bench_query,
);

criterion_main!(benches);
