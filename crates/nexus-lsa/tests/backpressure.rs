//! Admission control integration tests.
//!
//! Regions placed in groups with hard limits push the groups under
//! pressure; requests admitted through `run_when_memory_available` must
//! wait until the regions give memory back.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nexus_lsa::{GroupConfig, MemoryError, Region, RegionGroup, Tracker, TrackerConfig};
use tracing_subscriber::EnvFilter;

const S: usize = 64 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("nexus_lsa=debug"))
        .with_test_writer()
        .try_init();
}

/// Allocates 1 KB records until `region` holds `segments` segments.
fn fill(region: &Region, segments: usize) {
    while region.segment_count() < segments {
        region.alloc([0u8; 1000]).unwrap();
    }
}

#[tokio::test]
async fn test_blocked_until_region_frees_memory() {
    init_tracing();
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let group = RegionGroup::new("memtables", GroupConfig::unlimited().with_hard_limit(2 * S)).unwrap();
    let a = Region::with_group(&tracker, &group);
    let b = Region::with_group(&tracker, &group);

    fill(&a, 2);
    assert!(group.execution_permitted());
    fill(&b, 1);
    assert_eq!(group.memory_used(), 3 * S);
    assert!(group.under_pressure());

    let err = group
        .run_when_memory_available(S, Some(Duration::from_millis(10)), || async {})
        .await
        .unwrap_err();
    assert_eq!(err, MemoryError::Timeout { duration_ms: 10 });

    let ran = Rc::new(RefCell::new(false));
    let flag = ran.clone();
    let fut = group.run_when_memory_available(S, None, || async move {
        *flag.borrow_mut() = true;
    });
    tokio::pin!(fut);
    assert!(tokio::time::timeout(Duration::from_millis(10), &mut fut)
        .await
        .is_err());
    assert!(!*ran.borrow());
    assert_eq!(group.blocked_requests(), 1);

    a.clear();
    assert!(!group.under_pressure());
    fut.await.unwrap();
    assert!(*ran.borrow());
    assert_eq!(group.blocked_requests(), 0);
}

#[tokio::test]
async fn test_waiters_released_in_order() {
    init_tracing();
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let group = RegionGroup::new("g", GroupConfig::unlimited().with_hard_limit(S)).unwrap();
    let region = Region::with_group(&tracker, &group);
    fill(&region, 2);
    assert!(group.under_pressure());

    let order = Rc::new(RefCell::new(Vec::new()));
    let first_order = order.clone();
    let second_order = order.clone();
    let first = group.run_when_memory_available(S, None, || async move {
        tokio::task::yield_now().await;
        first_order.borrow_mut().push(1);
    });
    let second = group.run_when_memory_available(S, None, || async move {
        second_order.borrow_mut().push(2);
    });
    tokio::pin!(first);
    tokio::pin!(second);

    // Poll each once so both are queued, first before second.
    assert!(tokio::time::timeout(Duration::from_millis(1), &mut first)
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(1), &mut second)
        .await
        .is_err());
    assert_eq!(group.blocked_requests(), 2);

    region.clear();
    let (a, b) = tokio::join!(second, first);
    a.unwrap();
    b.unwrap();
    assert_eq!(*order.borrow(), vec![1, 2]);
}

#[tokio::test]
async fn test_subgroup_waits_for_parent() {
    init_tracing();
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let root = RegionGroup::new("root", GroupConfig::unlimited().with_hard_limit(S)).unwrap();
    let child = RegionGroup::with_parent("child", GroupConfig::unlimited(), &root).unwrap();
    let region = Region::with_group(&tracker, &child);

    fill(&region, 2);
    assert!(root.under_pressure());
    assert!(!child.under_pressure());
    assert!(!child.execution_permitted());

    let fut = child.run_when_memory_available(S, None, || async { "done" });
    tokio::pin!(fut);
    assert!(tokio::time::timeout(Duration::from_millis(10), &mut fut)
        .await
        .is_err());
    // The request waits at the root, which is the group under pressure.
    assert_eq!(root.blocked_requests(), 1);
    assert_eq!(child.blocked_requests(), 0);

    region.clear();
    assert_eq!(fut.await.unwrap(), "done");
    assert_eq!(root.memory_used(), 0);
}

#[tokio::test]
async fn test_timeouts_leave_queue_empty() {
    init_tracing();
    let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
    let group = RegionGroup::new("g", GroupConfig::unlimited().with_hard_limit(S)).unwrap();
    let region = Region::with_group(&tracker, &group);
    fill(&region, 2);

    for _ in 0..3 {
        let result = group
            .run_when_memory_available(S, Some(Duration::from_millis(5)), || async {})
            .await;
        assert!(matches!(result, Err(MemoryError::Timeout { .. })));
        assert_eq!(group.blocked_requests(), 0);
    }

    region.clear();
    let value = group
        .run_when_memory_available(S, Some(Duration::from_millis(5)), || async { 42 })
        .await
        .unwrap();
    assert_eq!(value, 42);
}
