//! Reclaim integration tests.
//!
//! These tests exercise the path from a memory request to memory returned
//! to the system: pool release, segment migration, compaction and eviction.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nexus_lsa::{EvictionOutcome, Handle, Region, Tracker, TrackerConfig};

type Record = [u8; 1000];

const S: usize = 64 * 1024;

fn record(i: usize) -> Record {
    let mut record = [0u8; 1000];
    record[..8].copy_from_slice(&(i as u64).to_le_bytes());
    record
}

fn record_id(record: &Record) -> usize {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record[..8]);
    u64::from_le_bytes(bytes) as usize
}

/// Fills `region` with `count` records and frees three out of four.
fn fragment(region: &Region, count: usize) -> Vec<(usize, Handle<Record>)> {
    let mut kept = Vec::new();
    for i in 0..count {
        let handle = region.alloc(record(i)).unwrap();
        if i % 4 == 0 {
            kept.push((i, handle));
        } else {
            region.free(handle);
        }
    }
    kept
}

#[test]
fn test_reclaim_scenario() {
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let region = Region::new(&tracker);
    let kept = fragment(&region, 200 * 64);
    assert!(region.segment_count() >= 200);

    let before = tracker.total_memory_in_use();
    let freed = tracker.reclaim(50 * S);
    let after = tracker.total_memory_in_use();
    assert!(freed >= 50 * S, "freed only {freed} bytes");
    assert_eq!(before - after, freed);

    for (i, handle) in &kept {
        assert_eq!(region.with(*handle, record_id), Some(*i));
    }
    assert_eq!(tracker.stats().reclaims, 1);
}

#[test]
fn test_reclaim_is_monotonic_and_idempotent() {
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let region = Region::new(&tracker);
    let kept = fragment(&region, 100 * 64);

    let mut total = tracker.total_memory_in_use();
    for _ in 0..3 {
        let freed = tracker.reclaim(10 * S);
        let now = tracker.total_memory_in_use();
        assert!(now <= total);
        assert_eq!(total - now, freed);
        total = now;
    }

    tracker.reclaim(usize::MAX);
    assert_eq!(tracker.reclaim(usize::MAX), 0);
    assert!(!region.is_compactible());

    for (i, handle) in &kept {
        assert_eq!(region.with(*handle, record_id), Some(*i));
    }
}

#[test]
fn test_pinned_region_is_left_alone() {
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let region = Region::new(&tracker);
    let kept = fragment(&region, 40 * 64);

    let counter = region.reclaim_counter();
    let segments = region.segment_count();
    region.with_reclaiming_disabled(|| {
        tracker.reclaim(usize::MAX);
    });
    assert_eq!(region.reclaim_counter(), counter);
    assert_eq!(region.segment_count(), segments);

    tracker.set_reclaiming_enabled(false);
    tracker.reclaim(usize::MAX);
    assert_eq!(region.segment_count(), segments);
    tracker.set_reclaiming_enabled(true);

    for (i, handle) in &kept {
        assert_eq!(region.with(*handle, record_id), Some(*i));
    }
}

#[test]
fn test_memory_limit_compacts_other_regions() {
    let config = TrackerConfig::for_testing()
        .with_memory_limit(32 * S)
        .with_zone_segments(4, 8)
        .with_emergency_reserve(1);
    let tracker = Tracker::new(config).unwrap();
    let sparse = Region::new(&tracker);
    let busy = Region::new(&tracker);

    let kept = fragment(&sparse, 24 * 64);
    assert_eq!(sparse.segment_count(), 24);
    // Compaction of full regions needs a spare destination segment.
    tracker.refill_emergency_reserve().unwrap();

    let fresh: Vec<_> = (0..16 * 64)
        .map(|i| busy.alloc(record(i)).expect("compaction should make room"))
        .collect();

    assert!(sparse.reclaim_counter() > 0);
    assert!(sparse.segment_count() < 24);
    assert!(tracker.total_memory_in_use() <= 32 * S);
    for (i, handle) in &kept {
        assert_eq!(sparse.with(*handle, record_id), Some(*i));
    }
    for (i, handle) in fresh.iter().enumerate() {
        assert_eq!(busy.with(*handle, record_id), Some(i));
    }
}

#[test]
fn test_eviction_under_memory_limit() {
    let config = TrackerConfig::for_testing()
        .with_memory_limit(16 * S)
        .with_zone_segments(4, 8)
        .with_emergency_reserve(1);
    let tracker = Tracker::new(config).unwrap();

    // A cache region evicting its oldest entries on demand.
    let cache = Rc::new(Region::new(&tracker));
    let entries: Rc<RefCell<VecDeque<Handle<Record>>>> = Rc::default();
    {
        let weak = Rc::downgrade(&cache);
        let entries = entries.clone();
        cache.make_evictable(move || {
            let Some(cache) = weak.upgrade() else {
                return EvictionOutcome::NothingEvicted;
            };
            let oldest = entries.borrow_mut().pop_front();
            match oldest {
                Some(handle) => {
                    cache.free(handle);
                    EvictionOutcome::Evicted
                }
                None => EvictionOutcome::NothingEvicted,
            }
        });
    }
    for i in 0..12 * 64 {
        let handle = cache.alloc(record(i)).unwrap();
        entries.borrow_mut().push_back(handle);
    }

    let other = Region::new(&tracker);
    let handles: Vec<_> = (0..8 * 64)
        .map(|i| other.alloc(record(i)).expect("eviction should make room"))
        .collect();

    let stats = tracker.stats();
    assert!(stats.evictions > 0);
    assert!(entries.borrow().len() < 12 * 64);
    assert!(tracker.total_memory_in_use() <= 16 * S);
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(other.with(*handle, record_id), Some(i));
    }
    for handle in entries.borrow().iter() {
        assert!(cache.contains(*handle));
    }
    cache.make_not_evictable();
}

#[test]
fn test_reclaim_without_reserve_never_maps_zones() {
    let config = TrackerConfig::for_testing()
        .with_zone_segments(4, 4)
        .with_emergency_reserve(0);
    let tracker = Tracker::new(config).unwrap();
    let region = Region::new(&tracker);

    // Every mapped segment in use, half of each one free.
    let mut handles = Vec::new();
    while region.segment_count() < 16 {
        handles.push(region.alloc(record(handles.len())).unwrap());
    }
    let mut kept = Vec::new();
    for (i, handle) in handles.into_iter().enumerate() {
        if i % 2 == 0 {
            region.free(handle);
        } else {
            kept.push((i, handle));
        }
    }
    let pool = tracker.pool_stats();
    assert_eq!(pool.mapped_bytes, 16 * S);
    assert_eq!(pool.free_segments + pool.reserve_segments, 0);

    let before = tracker.total_memory_in_use();
    let freed = tracker.reclaim(4 * S);
    let after = tracker.pool_stats();
    assert!(freed >= S, "freed only {freed} bytes");
    assert_eq!(before - tracker.total_memory_in_use(), freed);
    assert_eq!(after.zones_created, pool.zones_created);
    assert_eq!(after.mapped_bytes, 16 * S - freed);

    for (i, handle) in &kept {
        assert_eq!(region.with(*handle, record_id), Some(*i));
    }
}

#[test]
fn test_refill_emergency_reserve() {
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    tracker.refill_emergency_reserve().unwrap();
    assert_eq!(
        tracker.pool_stats().reserve_segments,
        tracker.config().emergency_reserve_max
    );
}
