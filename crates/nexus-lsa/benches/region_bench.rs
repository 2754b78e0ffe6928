//! Region benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use nexus_lsa::{GroupConfig, Region, RegionGroup, Tracker, TrackerConfig};

fn tracker() -> Tracker {
    Tracker::new(TrackerConfig::for_testing()).expect("valid bench config")
}

fn alloc_benchmark(c: &mut Criterion) {
    let tracker = tracker();
    c.bench_function("region_alloc_10000", |b| {
        b.iter(|| {
            let region = Region::new(&tracker);
            for i in 0..10_000u64 {
                black_box(region.alloc(i).unwrap());
            }
            black_box(region.segment_count())
        })
    });
}

fn alloc_free_benchmark(c: &mut Criterion) {
    let tracker = tracker();
    let region = Region::new(&tracker);
    c.bench_function("region_alloc_free_1000", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..1000u64).map(|i| region.alloc(i).unwrap()).collect();
            for handle in handles {
                region.free(handle);
            }
        })
    });
}

fn access_benchmark(c: &mut Criterion) {
    let tracker = tracker();
    let region = Region::new(&tracker);
    let handles: Vec<_> = (0..10_000u64).map(|i| region.alloc(i).unwrap()).collect();

    c.bench_function("region_with_10000", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for handle in &handles {
                sum += region.with(*handle, |v| *v).unwrap_or(0);
            }
            black_box(sum)
        })
    });
}

fn full_compaction_benchmark(c: &mut Criterion) {
    let tracker = tracker();
    c.bench_function("region_full_compaction_checkerboard", |b| {
        b.iter_batched(
            || {
                let region = Region::new(&tracker);
                let handles: Vec<_> = (0..2000).map(|_| region.alloc([0u8; 1000]).unwrap()).collect();
                for handle in handles.iter().step_by(2) {
                    region.free(*handle);
                }
                region
            },
            |region| {
                region.full_compaction();
                black_box(region.segment_count())
            },
            BatchSize::SmallInput,
        )
    });
}

fn reclaim_benchmark(c: &mut Criterion) {
    let tracker = tracker();
    c.bench_function("tracker_reclaim_fragmented", |b| {
        b.iter_batched(
            || {
                let region = Region::new(&tracker);
                let handles: Vec<_> = (0..4000).map(|_| region.alloc([0u8; 1000]).unwrap()).collect();
                for (i, handle) in handles.iter().enumerate() {
                    if i % 4 != 0 {
                        region.free(*handle);
                    }
                }
                region
            },
            |region| {
                black_box(tracker.reclaim(16 * tracker.config().segment_size));
                region
            },
            BatchSize::SmallInput,
        )
    });
}

fn admission_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime");
    let group = RegionGroup::new("bench", GroupConfig::unlimited().with_hard_limit(1 << 30))
        .expect("valid group config");

    c.bench_function("group_run_when_memory_available", |b| {
        b.to_async(&runtime).iter(|| async {
            group
                .run_when_memory_available(4096, None, || async { black_box(1) })
                .await
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    alloc_benchmark,
    alloc_free_benchmark,
    access_benchmark,
    full_compaction_benchmark,
    reclaim_benchmark,
    admission_benchmark,
);
criterion_main!(benches);
