//! Per-shard tracker.
//!
//! The tracker owns the segment pool and the slot table of a shard and
//! keeps a registry of every live region. It is the component that turns a
//! memory request into reclaim work:
//!
//! ```text
//!   reclaim(bytes)
//!     |
//!     +--> pool: release reserve surplus, migrate + unmap zone tails
//!     |
//!     +--> not enough? compact_and_evict(rest)
//!     |       +--> compact the sparsest segments of compactible regions
//!     |       +--> call evictors, compact again, ...
//!     |
//!     +--> pool again: unmap what compaction freed
//! ```
//!
//! Reclaim is not reentrant: a region allocating during compaction (for
//! example because an evictor allocated) never triggers nested reclaim.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::config::TrackerConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::handle::SlotTable;
use crate::occupancy::OccupancyStats;
use crate::pool::{NoGrowth, PoolStats, ReservationGoal, SegmentPool};
use crate::region::{EvictionOutcome, RegionId, RegionImpl};
use crate::segment::Segment;
use crate::zone::SegmentOwner;

/// Outcome of [`Tracker::compact_on_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCompaction {
    /// The work predicate asked to stop.
    Interrupted,
    /// No region is worth compacting any more.
    NoMoreWork,
}

/// Tracker statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerStats {
    /// Registered regions.
    pub regions: usize,
    /// Live objects across all regions.
    pub objects: usize,
    /// Occupancy of all regions.
    pub occupancy: OccupancyStats,
    /// Calls to `reclaim`.
    pub reclaims: u64,
    /// Bytes returned to the system by `reclaim`.
    pub bytes_reclaimed: u64,
    /// Segments emptied by compaction.
    pub segments_compacted: u64,
    /// Evictor calls that freed memory.
    pub evictions: u64,
    /// Segment allocations that failed after reclaim.
    pub allocation_failures: u64,
    /// Pool accounting.
    pub pool: PoolStats,
}

impl fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "regions: {}, objects: {}, occupancy: {}, reclaims: {} ({} B), compacted: {} segs, evictions: {}, failures: {}; {}",
            self.regions,
            self.objects,
            self.occupancy,
            self.reclaims,
            self.bytes_reclaimed,
            self.segments_compacted,
            self.evictions,
            self.allocation_failures,
            self.pool
        )
    }
}

// =============================================================================
// Tracker internals
// =============================================================================

/// Shared state of a tracker, borrowed by regions during their operations.
pub(crate) struct TrackerImpl {
    pub(crate) config: TrackerConfig,
    pub(crate) pool: RefCell<SegmentPool>,
    pub(crate) slots: RefCell<SlotTable>,
    regions: RefCell<BTreeMap<RegionId, Weak<RefCell<RegionImpl>>>>,
    /// Depth of nested reclaim-locked sections.
    reclaim_lock: Cell<usize>,
    reclaiming_enabled: Cell<bool>,
    reclamation_step: Cell<usize>,
    abort_on_bad_alloc: Cell<bool>,
    reclaims: Cell<u64>,
    bytes_reclaimed: Cell<u64>,
    segments_compacted: Cell<u64>,
    evictions: Cell<u64>,
    allocation_failures: Cell<u64>,
}

/// Heap entry of `compact_and_evict`. Compactible regions come first, then
/// the ones whose sparsest segment is emptiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    compactible: bool,
    sparsest: Reverse<usize>,
    index: usize,
}

impl TrackerImpl {
    fn new(config: TrackerConfig) -> Self {
        let pool = SegmentPool::new(&config);
        Self {
            reclamation_step: Cell::new(config.reclamation_step),
            abort_on_bad_alloc: Cell::new(config.abort_on_bad_alloc),
            config,
            pool: RefCell::new(pool),
            slots: RefCell::new(SlotTable::new()),
            regions: RefCell::new(BTreeMap::new()),
            reclaim_lock: Cell::new(0),
            reclaiming_enabled: Cell::new(true),
            reclaims: Cell::new(0),
            bytes_reclaimed: Cell::new(0),
            segments_compacted: Cell::new(0),
            evictions: Cell::new(0),
            allocation_failures: Cell::new(0),
        }
    }

    pub fn register(&self, id: RegionId, region: Weak<RefCell<RegionImpl>>) {
        self.regions.borrow_mut().insert(id, region);
    }

    pub fn unregister(&self, id: RegionId) {
        self.regions.borrow_mut().remove(&id);
    }

    #[inline]
    fn segment_size(&self) -> usize {
        self.config.segment_size
    }

    fn can_reclaim(&self) -> bool {
        self.reclaim_lock.get() == 0 && self.reclaiming_enabled.get()
    }

    // -----------------------------------------------------------------
    // Segment supply
    // -----------------------------------------------------------------

    /// Gets a segment for a region, compacting and evicting if the pool is exhausted.
    pub fn allocate_segment(&self) -> MemoryResult<Segment> {
        loop {
            let segment = self.pool.borrow_mut().allocate_segment();
            if let Some(segment) = segment {
                return Ok(segment);
            }
            if !self.can_reclaim() || self.compact_and_evict(self.segment_size()) == 0 {
                return self.bad_alloc(self.segment_size());
            }
        }
    }

    /// Gets a compaction destination. May dip into the emergency reserve
    /// and never triggers reclaim.
    pub fn allocate_compaction_segment(&self) -> Option<Segment> {
        let _goal = ReservationGoal::new(&self.pool, 0);
        let segment = self.pool.borrow_mut().allocate_segment();
        segment
    }

    /// Makes room for an oversized allocation of `bytes`.
    pub fn reserve_large(&self, bytes: usize) -> bool {
        if self.pool.borrow().can_allocate_more_memory(bytes) {
            return true;
        }
        if self.can_reclaim() {
            self.reclaim(bytes);
        }
        let fits = self.pool.borrow().can_allocate_more_memory(bytes);
        fits
    }

    pub fn record_segment_compacted(&self) {
        self.segments_compacted.set(self.segments_compacted.get() + 1);
    }

    fn bad_alloc<T>(&self, bytes: usize) -> MemoryResult<T> {
        self.pool.borrow_mut().set_allocation_failure_flag();
        self.allocation_failures
            .set(self.allocation_failures.get() + 1);
        let stats = self.pool.borrow().stats();
        if self.abort_on_bad_alloc.get() {
            error!(bytes, %stats, "segment allocation failed, aborting");
            std::process::abort();
        }
        warn!(bytes, %stats, "segment allocation failed");
        Err(MemoryError::out_of_memory(bytes))
    }

    // -----------------------------------------------------------------
    // Reclaim
    // -----------------------------------------------------------------

    /// Returns at least `bytes` (rounded up to the reclamation step) to the
    /// system if possible. Returns the decrease of total memory in use.
    pub fn reclaim(&self, bytes: usize) -> usize {
        if self.reclaim_lock.get() > 0 {
            return 0;
        }
        let segment_size = self.segment_size();
        let step = self.reclamation_step.get() * segment_size;
        let segments = bytes.max(step).div_ceil(segment_size);
        let before = self.pool.borrow().total_memory_in_use();

        let released = self.reclaim_from_pool(segments);
        if released < segments && self.reclaiming_enabled.get() {
            // Compaction destinations come from the reserve or free zone segments.
            let _no_growth = NoGrowth::new(&self.pool);
            self.compact_and_evict((segments - released).saturating_mul(segment_size));
            self.reclaim_from_pool(segments - released);
        }

        let after = self.pool.borrow().total_memory_in_use();
        let freed = before.saturating_sub(after);
        self.reclaims.set(self.reclaims.get() + 1);
        self.bytes_reclaimed
            .set(self.bytes_reclaimed.get() + freed as u64);
        debug!(requested = bytes, freed, "reclaim finished");
        freed
    }

    /// Asks the pool to unmap `segments`, migrating region segments out of
    /// the way. Regions that are busy or have reclaiming disabled stay put.
    fn reclaim_from_pool(&self, segments: usize) -> usize {
        let _lock = ReclaimLock::acquire(&self.reclaim_lock);
        let regions = self.regions.borrow().clone();
        let mut migrate = |owner: SegmentOwner, src: Segment, dst: Segment| -> bool {
            let Some(region) = regions.get(&owner.region).and_then(Weak::upgrade) else {
                return false;
            };
            let Ok(mut locked) = region.try_borrow_mut() else {
                return false;
            };
            locked.migrate_segment(owner.index, src, dst)
        };
        let released = self
            .pool
            .borrow_mut()
            .reclaim_segments(segments, &mut migrate);
        released
    }

    /// Compacts and evicts until `used_memory` dropped by `bytes` or no more
    /// progress can be made. Returns the decrease of used memory.
    pub fn compact_and_evict(&self, bytes: usize) -> usize {
        if self.reclaim_lock.get() > 0 {
            return 0;
        }
        let _lock = ReclaimLock::acquire(&self.reclaim_lock);
        let before = self.pool.borrow().used_memory();
        let target = before.saturating_sub(bytes);
        let regions = self.live_regions();

        loop {
            self.compact_until(&regions, target);
            if self.used_memory() <= target || !self.evict_round(&regions, target) {
                break;
            }
        }

        let freed = before.saturating_sub(self.used_memory());
        debug!(
            requested = bytes,
            freed,
            regions = regions.len(),
            "compact and evict finished"
        );
        freed
    }

    /// Compacts one segment at a time, always from the most promising region.
    fn compact_until(&self, regions: &[Rc<RefCell<RegionImpl>>], target: usize) {
        let mut heap: BinaryHeap<Candidate> = regions
            .iter()
            .enumerate()
            .filter_map(|(index, region)| self.candidate(region, index))
            .collect();

        while self.used_memory() > target {
            let Some(candidate) = heap.pop() else {
                break;
            };
            if !candidate.compactible {
                break;
            }
            let region = &regions[candidate.index];
            let compacted = match region.try_borrow_mut() {
                Ok(mut locked) => locked.compact_one(self),
                Err(_) => false,
            };
            if compacted {
                if let Some(next) = self.candidate(region, candidate.index) {
                    heap.push(next);
                }
            }
        }
    }

    /// Calls every evictor once. Returns true if any of them freed memory.
    fn evict_round(&self, regions: &[Rc<RefCell<RegionImpl>>], target: usize) -> bool {
        let mut progress = false;
        for region in regions {
            if self.used_memory() <= target {
                break;
            }
            let Some(evictor) = region.try_borrow_mut().ok().and_then(|r| r.evictor()) else {
                continue;
            };
            let Ok(mut evict) = evictor.try_borrow_mut() else {
                continue;
            };
            let evict: &mut dyn FnMut() -> EvictionOutcome = &mut **evict;
            if evict() == EvictionOutcome::Evicted {
                self.evictions.set(self.evictions.get() + 1);
                progress = true;
            }
        }
        trace!(progress, "eviction round");
        progress
    }

    fn candidate(&self, region: &RefCell<RegionImpl>, index: usize) -> Option<Candidate> {
        let region = region.try_borrow().ok()?;
        Some(Candidate {
            compactible: region.is_compactible(&self.config),
            sparsest: Reverse(region.min_used_space()),
            index,
        })
    }

    fn live_regions(&self) -> Vec<Rc<RefCell<RegionImpl>>> {
        self.regions
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn used_memory(&self) -> usize {
        self.pool.borrow().used_memory()
    }

    fn compact_on_idle(&self, check_for_work: &mut dyn FnMut() -> bool) -> IdleCompaction {
        if self.reclaim_lock.get() > 0 {
            return IdleCompaction::NoMoreWork;
        }
        let _lock = ReclaimLock::acquire(&self.reclaim_lock);
        let regions = self.live_regions();
        loop {
            if check_for_work() {
                return IdleCompaction::Interrupted;
            }
            let sparsest = regions
                .iter()
                .enumerate()
                .filter_map(|(index, region)| {
                    let region = region.try_borrow().ok()?;
                    if region.is_idle_compactible(&self.config) {
                        Some((region.min_used_space(), index))
                    } else {
                        None
                    }
                })
                .min();
            let Some((_, index)) = sparsest else {
                return IdleCompaction::NoMoreWork;
            };
            let compacted = match regions[index].try_borrow_mut() {
                Ok(mut region) => region.compact_one(self),
                Err(_) => false,
            };
            if !compacted {
                return IdleCompaction::NoMoreWork;
            }
        }
    }
}

/// Marks the tracker as reclaiming for its lifetime.
struct ReclaimLock<'a> {
    depth: &'a Cell<usize>,
}

impl<'a> ReclaimLock<'a> {
    fn acquire(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self { depth }
    }
}

impl Drop for ReclaimLock<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Handle to the allocator state of one shard.
///
/// Cloning a tracker is cheap; every clone refers to the same pool. Regions
/// keep a clone of the tracker they were created with.
///
/// # Example
///
/// ```ignore
/// let tracker = Tracker::new(TrackerConfig::default())?;
/// let region = Region::new(&tracker);
/// let handle = region.alloc(42u64)?;
/// tracker.reclaim(1 << 20);
/// assert_eq!(region.get(handle), Some(42));
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Rc<TrackerImpl>,
}

impl Tracker {
    /// Creates a tracker with its own segment pool.
    pub fn new(config: TrackerConfig) -> MemoryResult<Self> {
        config.validate().map_err(MemoryError::config)?;
        debug!(
            segment_size = config.segment_size,
            memory_limit = config.effective_memory_limit(),
            "tracker created"
        );
        Ok(Self {
            inner: Rc::new(TrackerImpl::new(config)),
        })
    }

    #[inline]
    pub(crate) fn inner(&self) -> &TrackerImpl {
        &self.inner
    }

    pub(crate) fn ptr_eq(&self, other: &Tracker) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the configuration.
    #[must_use]
    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Tries to return `bytes` to the system, compacting and evicting if
    /// releasing free memory is not enough. Returns the bytes released.
    pub fn reclaim(&self, bytes: usize) -> usize {
        self.inner.reclaim(bytes)
    }

    /// Compacts regions and calls evictors until used memory dropped by
    /// `bytes`. Returns the decrease of used memory.
    pub fn compact_and_evict(&self, bytes: usize) -> usize {
        self.inner.compact_and_evict(bytes)
    }

    /// Compacts idle-compactible regions one segment at a time until
    /// `check_for_work` returns true or nothing is left to do.
    pub fn compact_on_idle<F>(&self, mut check_for_work: F) -> IdleCompaction
    where
        F: FnMut() -> bool,
    {
        self.inner.compact_on_idle(&mut check_for_work)
    }

    /// Runs a full compaction of every region that is not busy and has
    /// reclaiming enabled.
    pub fn full_compaction(&self) {
        for region in self.inner.live_regions() {
            if let Ok(mut region) = region.try_borrow_mut() {
                if region.reclaiming_enabled() {
                    region.full_compaction(&self.inner);
                }
            }
        }
    }

    /// Combined occupancy of every region.
    pub fn region_occupancy(&self) -> OccupancyStats {
        self.inner
            .live_regions()
            .iter()
            .filter_map(|region| region.try_borrow().ok().map(|r| r.occupancy()))
            .fold(OccupancyStats::empty(), |acc, occupancy| acc + occupancy)
    }

    /// Region occupancy plus free pool segments, counted as free space.
    pub fn occupancy(&self) -> OccupancyStats {
        let pool = self.pool_stats();
        let free = (pool.free_segments + pool.reserve_segments) * pool.segment_size;
        self.region_occupancy() + OccupancyStats::new(free, free)
    }

    /// Sets how many segments a reclaim asks for at least.
    pub fn set_reclamation_step(&self, segments: usize) {
        self.inner.reclamation_step.set(segments.max(1));
    }

    /// Minimum segments a reclaim asks for.
    #[must_use]
    pub fn reclamation_step(&self) -> usize {
        self.inner.reclamation_step.get()
    }

    /// Makes segment allocation failures abort the process.
    pub fn enable_abort_on_bad_alloc(&self) {
        self.inner.abort_on_bad_alloc.set(true);
    }

    /// True if segment allocation failures abort the process.
    #[must_use]
    pub fn should_abort_on_bad_alloc(&self) -> bool {
        self.inner.abort_on_bad_alloc.get()
    }

    /// Enables or disables compaction and eviction during reclaim.
    pub fn set_reclaiming_enabled(&self, enabled: bool) {
        self.inner.reclaiming_enabled.set(enabled);
    }

    /// True unless reclaim is limited to releasing free memory.
    #[must_use]
    pub fn reclaiming_enabled(&self) -> bool {
        self.inner.reclaiming_enabled.get()
    }

    /// Tops up the emergency reserve, reclaiming if needed.
    pub fn refill_emergency_reserve(&self) -> MemoryResult<()> {
        let inner = &self.inner;
        loop {
            let refilled = inner.pool.borrow_mut().refill_emergency_reserve();
            if refilled {
                return Ok(());
            }
            if !inner.can_reclaim() || inner.compact_and_evict(inner.segment_size()) == 0 {
                return inner.bad_alloc(inner.segment_size());
            }
        }
    }

    /// Number of registered regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.inner.regions.borrow().len()
    }

    /// Returns tracker statistics.
    pub fn stats(&self) -> TrackerStats {
        let inner = &self.inner;
        TrackerStats {
            regions: self.region_count(),
            objects: inner.slots.borrow().len(),
            occupancy: self.region_occupancy(),
            reclaims: inner.reclaims.get(),
            bytes_reclaimed: inner.bytes_reclaimed.get(),
            segments_compacted: inner.segments_compacted.get(),
            evictions: inner.evictions.get(),
            allocation_failures: inner.allocation_failures.get(),
            pool: self.pool_stats(),
        }
    }

    /// Returns pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.borrow().stats()
    }

    /// Bytes held from the system.
    pub fn total_memory_in_use(&self) -> usize {
        self.inner.pool.borrow().total_memory_in_use()
    }

    /// Bytes used by regions.
    pub fn used_memory(&self) -> usize {
        self.inner.pool.borrow().used_memory()
    }

    /// Bytes that can still be taken from the system.
    pub fn free_memory(&self) -> usize {
        self.inner.pool.borrow().free_memory()
    }

    /// True if the last segment allocation failed.
    pub(crate) fn allocation_failure_flag(&self) -> bool {
        self.inner.pool.borrow().allocation_failure_flag()
    }

    pub(crate) fn clear_allocation_failure_flag(&self) {
        self.inner.pool.borrow_mut().clear_allocation_failure_flag();
    }

    /// Shuts the tracker down and returns its memory to the system.
    ///
    /// # Panics
    ///
    /// Panics if any region is still alive.
    pub fn shutdown(self) {
        let regions = self.region_count();
        assert_eq!(regions, 0, "tracker shut down with {regions} live regions");
        let mut pool = self.inner.pool.borrow_mut();
        assert_eq!(
            pool.segments_in_use(),
            0,
            "tracker shut down with segments in use"
        );
        let released = pool.release_free_memory();
        debug!(segments = released, "tracker shut down");
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("regions", &self.region_count())
            .field("pool", &self.pool_stats())
            .finish()
    }
}
