//! Compaction integration tests.
//!
//! These tests drive regions through fragmenting workloads and verify that
//! compaction packs live objects without losing or corrupting any of them.

use nexus_lsa::{Handle, OccupancyStats, Region, Relocatable, Tracker, TrackerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A 1000-byte object plus its descriptor takes exactly 1 KB of a segment.
type Record = [u8; 1000];

fn test_tracker() -> Tracker {
    Tracker::new(TrackerConfig::for_testing()).expect("valid test config")
}

fn record(i: usize) -> Record {
    let mut record = [0u8; 1000];
    record[0] = i as u8;
    record[999] = (i >> 8) as u8;
    record
}

fn check_record(region: &Region, handle: Handle<Record>, i: usize) {
    let ok = region.with(handle, |r| r[0] == i as u8 && r[999] == (i >> 8) as u8);
    assert_eq!(ok, Some(true), "record {i} corrupted or missing");
}

#[test]
fn test_checkerboard_full_compaction() {
    let tracker = test_tracker();
    let segment_size = tracker.config().segment_size;
    let region = Region::new(&tracker);

    let handles: Vec<_> = (0..1000).map(|i| region.alloc(record(i)).unwrap()).collect();
    let per_segment = segment_size / 1024;
    assert_eq!(region.segment_count(), 1000usize.div_ceil(per_segment));

    for handle in handles.iter().skip(1).step_by(2) {
        assert!(region.free(*handle));
    }
    assert_eq!(region.object_count(), 500);

    region.full_compaction();
    assert_eq!(region.segment_count(), 500usize.div_ceil(per_segment));
    assert_eq!(tracker.pool_stats().segments_in_use, region.segment_count());

    for (i, handle) in handles.iter().enumerate().step_by(2) {
        check_record(&region, *handle, i);
    }
    for handle in handles.iter().skip(1).step_by(2) {
        assert!(!region.contains(*handle));
    }
}

#[test]
fn test_compact_frees_a_segment() {
    let tracker = test_tracker();
    let region = Region::new(&tracker);

    let handles: Vec<_> = (0..1000).map(|i| region.alloc(record(i)).unwrap()).collect();
    for handle in handles.iter().skip(1).step_by(2) {
        region.free(*handle);
    }
    assert!(region.is_compactible());

    // compact() stops once the shard uses one segment less; packing down
    // to the minimum segment count is full_compaction's job.
    let segments = region.segment_count();
    let in_use = tracker.pool_stats().segments_in_use;
    assert!(region.compact());
    assert!(region.segment_count() < segments);
    assert!(tracker.pool_stats().segments_in_use < in_use);

    for (i, handle) in handles.iter().enumerate().step_by(2) {
        check_record(&region, *handle, i);
    }
}

#[test]
fn test_dense_region_is_not_compactible() {
    let tracker = test_tracker();
    let region = Region::new(&tracker);
    let handles: Vec<_> = (0..1000).map(|i| region.alloc(record(i)).unwrap()).collect();
    assert!(!region.is_compactible());
    assert!(!region.compact());

    region.set_reclaiming_enabled(false);
    for handle in handles.iter().skip(1).step_by(2) {
        region.free(*handle);
    }
    assert!(!region.is_compactible());
    assert!(!region.compact());
}

#[test]
fn test_relocation_callback_runs_once_per_move() {
    #[derive(Clone)]
    struct Tracked {
        id: u32,
        moves: u32,
    }

    impl Relocatable for Tracked {
        fn relocated(mut self) -> Self {
            self.moves += 1;
            self
        }
    }

    let tracker = test_tracker();
    let region = Region::new(&tracker);
    let handles: Vec<_> = (0..6000)
        .map(|id| region.alloc(Tracked { id, moves: 0 }).unwrap())
        .collect();
    for handle in handles.iter().filter(|h| h.id().slot() % 3 != 0) {
        region.free(*handle);
    }

    let counter = region.reclaim_counter();
    region.full_compaction();
    assert!(region.reclaim_counter() > counter);

    for handle in handles.iter().filter(|h| region.contains(**h)) {
        let tracked = region.get(*handle).unwrap();
        assert_eq!(tracked.id % 3, 0);
        assert!(tracked.moves <= 1, "object {} moved {} times", tracked.id, tracked.moves);
    }
}

#[test]
fn test_oversized_object_routing() {
    let tracker = test_tracker();
    assert_eq!(tracker.config().segment_size, 64 * 1024);
    let region = Region::new(&tracker);

    let blob = vec![0xC3u8; 10_000];
    let handle = region.alloc_bytes(&blob, 1).unwrap();
    assert_eq!(region.segment_count(), 0);
    assert_eq!(region.occupancy(), OccupancyStats::new(0, 10_000));
    assert_eq!(tracker.pool_stats().non_lsa_memory_in_use, 10_000);
    assert_eq!(tracker.used_memory(), 10_000);

    // Small objects still go to segments.
    let small = region.alloc_bytes(&blob[..100], 1).unwrap();
    assert_eq!(region.segment_count(), 1);
    assert_eq!(region.size_of(small), Some(100));

    region.full_compaction();
    assert_eq!(region.with_bytes(handle, |bytes| bytes == &blob[..]), Some(true));

    region.free(handle);
    assert_eq!(tracker.pool_stats().non_lsa_memory_in_use, 0);
}

#[test]
fn test_random_workload_keeps_occupancy_consistent() {
    let tracker = test_tracker();
    let segment_size = tracker.config().segment_size;
    let max_small = tracker.config().max_small_object();
    let region = Region::new(&tracker);
    let mut rng = StdRng::seed_from_u64(0x15A);

    let mut live: Vec<(Handle<[u8]>, Vec<u8>)> = Vec::new();
    for round in 0..5000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let len = if rng.gen_bool(0.02) {
                rng.gen_range(max_small + 1..3 * max_small)
            } else {
                rng.gen_range(1..2048)
            };
            let align = 1 << rng.gen_range(0..5);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let handle = region.alloc_bytes(&data, align).unwrap();
            live.push((handle, data));
        } else {
            let index = rng.gen_range(0..live.len());
            let (handle, _) = live.swap_remove(index);
            assert!(region.free(handle));
        }

        if round % 500 == 499 {
            region.compact();
        }

        let occupancy = region.occupancy();
        let large: usize = live
            .iter()
            .filter(|(_, data)| data.len() > max_small)
            .map(|(_, data)| data.len())
            .sum();
        assert_eq!(occupancy.used_space() + occupancy.free_space(), occupancy.total_space());
        assert_eq!(occupancy.total_space(), region.segment_count() * segment_size + large);
    }

    region.full_compaction();
    for (handle, data) in &live {
        assert_eq!(region.with_bytes(*handle, |bytes| bytes == &data[..]), Some(true));
    }
    assert_eq!(region.object_count(), live.len());
}

#[test]
fn test_merge_then_compact() {
    let tracker = test_tracker();
    let a = Region::new(&tracker);
    let b = Region::new(&tracker);

    let ha: Vec<_> = (0..400).map(|i| a.alloc(record(i)).unwrap()).collect();
    let hb: Vec<_> = (400..800).map(|i| b.alloc(record(i)).unwrap()).collect();
    for handle in ha.iter().chain(&hb).skip(1).step_by(2) {
        assert!(a.free(*handle) || b.free(*handle));
    }

    let b_counter = b.reclaim_counter();
    a.merge(b);
    assert!(a.reclaim_counter() >= b_counter);
    assert_eq!(a.object_count(), 400);

    a.full_compaction();
    for (i, handle) in ha.iter().chain(&hb).enumerate().step_by(2) {
        check_record(&a, *handle, i);
    }
}

#[test]
fn test_no_segment_leak() {
    let tracker = test_tracker();
    {
        let a = Region::new(&tracker);
        let b = Region::new(&tracker);
        for i in 0..3000 {
            let h = a.alloc(record(i)).unwrap();
            if i % 3 == 0 {
                a.free(h);
            }
            b.alloc_bytes(&[i as u8; 7000], 8).unwrap();
        }
        a.compact();
        a.merge(b);
        a.full_compaction();
        assert!(tracker.used_memory() > 0);
    }
    let stats = tracker.stats();
    assert_eq!(stats.regions, 0);
    assert_eq!(stats.objects, 0);
    assert_eq!(stats.pool.segments_in_use, 0);
    assert_eq!(stats.pool.non_lsa_memory_in_use, 0);
    assert_eq!(tracker.used_memory(), 0);
    tracker.shutdown();
}
