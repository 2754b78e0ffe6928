//! Segment pool.
//!
//! The pool owns every zone of a shard and is the only component that maps
//! or unmaps memory. Regions get segments from it (through the tracker) and
//! give them back when they empty out.
//!
//! ```text
//!   zones (by base address)          has-free set        emergency reserve
//!   +--------+--------+--------+     { z0, z2 }          [seg, seg, seg]
//!   |   z0   |   z1   |   z2   |                          ^ never drained below
//!   +--------+--------+--------+                            the current goal
//!     low                 high
//! ```
//!
//! Allocation prefers the reserve surplus, then the lowest zone with a free
//! segment, then a fresh zone. Reclaim works the other way round: it walks
//! zones from the highest address down, migrates their used segments into
//! holes of lower zones and unmaps the free tails it leaves behind.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, trace};

use crate::config::TrackerConfig;
use crate::segment::Segment;
use crate::zone::{SegmentOwner, Zone};

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Segment size in bytes.
    pub segment_size: usize,
    /// Number of mapped zones.
    pub zones: usize,
    /// Bytes mapped by zones.
    pub mapped_bytes: usize,
    /// Segments owned by regions.
    pub segments_in_use: usize,
    /// Segments in the emergency reserve.
    pub reserve_segments: usize,
    /// Mapped segments not in use and not reserved.
    pub free_segments: usize,
    /// Bytes of oversized objects allocated outside segments.
    pub non_lsa_memory_in_use: usize,
    /// Zones mapped since creation.
    pub zones_created: u64,
    /// Zones fully unmapped since creation.
    pub zones_released: u64,
    /// Segments returned to the system since creation.
    pub segments_released: u64,
    /// Segments moved to a lower zone by reclaim since creation.
    pub segments_migrated: u64,
}

impl PoolStats {
    /// Memory used by regions: segments in use plus oversized objects.
    pub fn used_memory(&self) -> usize {
        self.segments_in_use * self.segment_size + self.non_lsa_memory_in_use
    }

    /// Memory held from the system: mapped zones plus oversized objects.
    pub fn total_memory_in_use(&self) -> usize {
        self.mapped_bytes + self.non_lsa_memory_in_use
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zones: {}, mapped: {} B, in use: {} segs, reserve: {} segs, free: {} segs, non-lsa: {} B",
            self.zones,
            self.mapped_bytes,
            self.segments_in_use,
            self.reserve_segments,
            self.free_segments,
            self.non_lsa_memory_in_use
        )
    }
}

/// Per-shard owner of zones and segments.
pub(crate) struct SegmentPool {
    segment_size: usize,
    zones: BTreeMap<usize, Zone>,
    zones_with_free: BTreeSet<usize>,
    reserve: Vec<Segment>,
    emergency_reserve_max: usize,
    current_emergency_reserve_goal: usize,
    segments_in_use: usize,
    non_lsa_memory_in_use: usize,
    memory_limit: usize,
    min_free_memory: usize,
    zone_min_segments: usize,
    zone_max_segments: usize,
    next_zone_segments: usize,
    allocation_failure_flag: bool,
    /// Cleared while reclaim compacts, so destinations never map new zones.
    growth_allowed: bool,
    zones_created: u64,
    zones_released: u64,
    segments_released: u64,
    segments_migrated: u64,
}

impl SegmentPool {
    /// Creates an empty pool. Nothing is mapped until the first allocation.
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            segment_size: config.segment_size,
            zones: BTreeMap::new(),
            zones_with_free: BTreeSet::new(),
            reserve: Vec::new(),
            emergency_reserve_max: config.emergency_reserve_max,
            current_emergency_reserve_goal: config.emergency_reserve_goal,
            segments_in_use: 0,
            non_lsa_memory_in_use: 0,
            memory_limit: config.effective_memory_limit(),
            min_free_memory: config.min_free_memory(),
            zone_min_segments: config.zone_min_segments,
            zone_max_segments: config.zone_max_segments,
            next_zone_segments: config.zone_min_segments,
            allocation_failure_flag: false,
            growth_allowed: true,
            zones_created: 0,
            zones_released: 0,
            segments_released: 0,
            segments_migrated: 0,
        }
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Hands out a segment, or `None` if neither the reserve surplus, the
    /// zones nor a new zone can provide one.
    pub fn allocate_segment(&mut self) -> Option<Segment> {
        let segment = if self.reserve.len() > self.current_emergency_reserve_goal {
            self.reserve.pop()
        } else {
            self.allocate_from_zones()
        }?;
        self.segments_in_use += 1;
        trace!(segment = segment.addr(), "segment allocated");
        Some(segment)
    }

    /// Takes back a segment previously returned by [`allocate_segment`](Self::allocate_segment).
    pub fn free_segment(&mut self, segment: Segment) {
        assert!(self.segments_in_use > 0, "segment freed with no segment in use");
        self.segments_in_use -= 1;
        self.set_owner(segment, None);
        if self.reserve.len() < self.emergency_reserve_max {
            self.reserve.push(segment);
        } else {
            self.zone_free(segment);
        }
        trace!(segment = segment.addr(), "segment freed");
    }

    /// Tops the emergency reserve up to its maximum. Returns false if memory ran out first.
    pub fn refill_emergency_reserve(&mut self) -> bool {
        while self.reserve.len() < self.emergency_reserve_max {
            match self.allocate_from_zones() {
                Some(segment) => self.reserve.push(segment),
                None => return false,
            }
        }
        true
    }

    #[inline]
    pub fn emergency_reserve_max(&self) -> usize {
        self.emergency_reserve_max
    }

    /// Sets the emergency reserve maximum, returning the previous value.
    pub fn set_emergency_reserve_max(&mut self, max: usize) -> usize {
        std::mem::replace(&mut self.emergency_reserve_max, max)
    }

    #[cfg(test)]
    pub fn current_emergency_reserve_goal(&self) -> usize {
        self.current_emergency_reserve_goal
    }

    /// Sets the number of reserve segments allocations leave alone, returning the previous value.
    pub fn set_current_emergency_reserve_goal(&mut self, goal: usize) -> usize {
        std::mem::replace(&mut self.current_emergency_reserve_goal, goal)
    }

    /// Allows or forbids mapping new zones, returning the previous setting.
    pub fn set_growth_allowed(&mut self, allowed: bool) -> bool {
        std::mem::replace(&mut self.growth_allowed, allowed)
    }

    #[cfg(test)]
    pub fn reserve_len(&self) -> usize {
        self.reserve.len()
    }

    // -----------------------------------------------------------------
    // Ownership
    // -----------------------------------------------------------------

    /// Records which region slot a segment belongs to.
    pub fn set_owner(&mut self, segment: Segment, owner: Option<SegmentOwner>) {
        if let Some((zone, index)) = self.zone_entry_mut(segment.addr()) {
            zone.set_owner(index, owner);
        }
    }

    #[cfg(test)]
    pub fn owner(&self, segment: Segment) -> Option<SegmentOwner> {
        let (zone, index) = self.zone_entry(segment.addr())?;
        zone.owner(index)
    }

    /// Returns the in-use segment containing `addr`.
    pub fn segment_containing(&self, addr: usize) -> Option<Segment> {
        let (zone, index) = self.zone_entry(addr)?;
        zone.is_used(index).then(|| zone.segment(index))
    }

    // -----------------------------------------------------------------
    // Reclaim
    // -----------------------------------------------------------------

    /// Returns up to `target` segments to the system.
    ///
    /// `migrate(owner, src, dst)` is asked to move a used segment's contents
    /// from `src` to `dst`; it returns false if the owner cannot be moved
    /// right now. Returns the number of segments unmapped.
    pub fn reclaim_segments(
        &mut self,
        target: usize,
        migrate: &mut dyn FnMut(SegmentOwner, Segment, Segment) -> bool,
    ) -> usize {
        if target == 0 {
            return 0;
        }
        while self.reserve.len() > self.current_emergency_reserve_goal {
            if let Some(segment) = self.reserve.pop() {
                self.zone_free(segment);
            }
        }

        let mut released = 0;
        let bases: Vec<usize> = self.zones.keys().rev().copied().collect();
        for base in bases {
            if released >= target {
                break;
            }
            self.evacuate_zone(base, target - released, migrate);
            released += self.shrink_zone(base, target - released);
        }

        if released > 0 {
            self.segments_released += released as u64;
            self.next_zone_segments = self.zone_min_segments;
            debug!(
                segments = released,
                bytes = released * self.segment_size,
                zones = self.zones.len(),
                "returned segments to the system"
            );
        }
        released
    }

    /// Releases everything not owned by a region: the whole reserve and
    /// every free segment that can be unmapped.
    pub fn release_free_memory(&mut self) -> usize {
        let goal = self.set_current_emergency_reserve_goal(0);
        let released = self.reclaim_segments(usize::MAX, &mut |_, _, _| false);
        self.set_current_emergency_reserve_goal(goal);
        released
    }

    // -----------------------------------------------------------------
    // Oversized objects
    // -----------------------------------------------------------------

    pub fn account_large(&mut self, bytes: usize) {
        self.non_lsa_memory_in_use += bytes;
    }

    pub fn release_large(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.non_lsa_memory_in_use);
        self.non_lsa_memory_in_use -= bytes;
    }

    // -----------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------

    /// True if mapping `bytes` more stays within the memory limit.
    pub fn can_allocate_more_memory(&self, bytes: usize) -> bool {
        self.total_memory_in_use()
            .saturating_add(bytes)
            .saturating_add(self.min_free_memory)
            <= self.memory_limit
    }

    #[inline]
    pub fn segments_in_use(&self) -> usize {
        self.segments_in_use
    }

    #[inline]
    pub fn non_lsa_memory_in_use(&self) -> usize {
        self.non_lsa_memory_in_use
    }

    pub fn mapped_bytes(&self) -> usize {
        self.zones.values().map(Zone::mapped_bytes).sum()
    }

    /// Mapped segments that are neither in use nor reserved.
    pub fn free_segments(&self) -> usize {
        self.zones.values().map(Zone::free_count).sum()
    }

    pub fn used_memory(&self) -> usize {
        self.segments_in_use * self.segment_size + self.non_lsa_memory_in_use
    }

    pub fn total_memory_in_use(&self) -> usize {
        self.mapped_bytes() + self.non_lsa_memory_in_use
    }

    pub fn free_memory(&self) -> usize {
        self.memory_limit.saturating_sub(self.total_memory_in_use())
    }

    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    #[inline]
    pub fn allocation_failure_flag(&self) -> bool {
        self.allocation_failure_flag
    }

    pub fn set_allocation_failure_flag(&mut self) {
        self.allocation_failure_flag = true;
    }

    pub fn clear_allocation_failure_flag(&mut self) {
        self.allocation_failure_flag = false;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            segment_size: self.segment_size,
            zones: self.zones.len(),
            mapped_bytes: self.mapped_bytes(),
            segments_in_use: self.segments_in_use,
            reserve_segments: self.reserve.len(),
            free_segments: self.free_segments(),
            non_lsa_memory_in_use: self.non_lsa_memory_in_use,
            zones_created: self.zones_created,
            zones_released: self.zones_released,
            segments_released: self.segments_released,
            segments_migrated: self.segments_migrated,
        }
    }

    // -----------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------

    fn zone_entry(&self, addr: usize) -> Option<(&Zone, usize)> {
        let (_, zone) = self.zones.range(..=addr).next_back()?;
        let index = zone.index_of(addr)?;
        Some((zone, index))
    }

    fn zone_entry_mut(&mut self, addr: usize) -> Option<(&mut Zone, usize)> {
        let (_, zone) = self.zones.range_mut(..=addr).next_back()?;
        let index = zone.index_of(addr)?;
        Some((zone, index))
    }

    fn allocate_from_zones(&mut self) -> Option<Segment> {
        if self.zones_with_free.is_empty() && !(self.growth_allowed && self.grow()) {
            return None;
        }
        let base = *self.zones_with_free.iter().next()?;
        self.zone_allocate(base)
    }

    fn zone_allocate(&mut self, base: usize) -> Option<Segment> {
        let zone = self.zones.get_mut(&base)?;
        let segment = zone.allocate()?;
        if !zone.has_free() {
            self.zones_with_free.remove(&base);
        }
        Some(segment)
    }

    fn zone_free(&mut self, segment: Segment) {
        let (zone, index) = self
            .zone_entry_mut(segment.addr())
            .unwrap_or_else(|| panic!("{segment:?} does not belong to any zone"));
        zone.free(index);
        let base = zone.base_addr();
        self.zones_with_free.insert(base);
    }

    /// Maps a new zone, halving the size on failure.
    fn grow(&mut self) -> bool {
        let mut segments = self.next_zone_segments;
        loop {
            let bytes = segments * self.segment_size;
            if self.can_allocate_more_memory(bytes) {
                if let Some(zone) = Zone::create(segments, self.segment_size) {
                    debug!(
                        base = zone.base_addr(),
                        segments,
                        bytes,
                        "mapped new zone"
                    );
                    let base = zone.base_addr();
                    self.zones.insert(base, zone);
                    self.zones_with_free.insert(base);
                    self.zones_created += 1;
                    self.next_zone_segments = (segments * 2).min(self.zone_max_segments);
                    return true;
                }
            }
            if segments == 1 {
                return false;
            }
            segments /= 2;
        }
    }

    /// Moves used segments out of the zone at `base`, highest first, until
    /// its free tail reaches `needed` or nothing can be moved.
    fn evacuate_zone(
        &mut self,
        base: usize,
        needed: usize,
        migrate: &mut dyn FnMut(SegmentOwner, Segment, Segment) -> bool,
    ) {
        loop {
            let Some(zone) = self.zones.get(&base) else {
                return;
            };
            if zone.free_tail() >= needed {
                return;
            }
            let Some(index) = zone.highest_used() else {
                return;
            };
            let src = zone.segment(index);
            let owner = zone.owner(index);

            let Some(&dst_base) = self.zones_with_free.range(..base).next() else {
                return;
            };
            let Some(dst) = self.zone_allocate(dst_base) else {
                return;
            };

            let moved = match owner {
                Some(owner) => migrate(owner, src, dst),
                None => match self.reserve.iter_mut().find(|s| **s == src) {
                    Some(slot) => {
                        *slot = dst;
                        true
                    }
                    None => false,
                },
            };
            if !moved {
                self.zone_free(dst);
                return;
            }
            self.set_owner(dst, owner);
            self.zone_free(src);
            self.segments_migrated += 1;
            trace!(src = src.addr(), dst = dst.addr(), "segment migrated");
        }
    }

    /// Unmaps up to `max_segments` from the free tail of the zone at `base`.
    fn shrink_zone(&mut self, base: usize, max_segments: usize) -> usize {
        let Some(zone) = self.zones.get_mut(&base) else {
            return 0;
        };
        let released = zone.shrink(max_segments);
        let empty = zone.len() == 0;
        let has_free = zone.has_free();
        if empty {
            self.zones.remove(&base);
            self.zones_with_free.remove(&base);
            self.zones_released += 1;
            debug!(base, "released zone");
        } else if !has_free {
            self.zones_with_free.remove(&base);
        }
        released
    }
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Lowers the emergency reserve goal for its lifetime, so the reserve can be
/// spent on compaction destinations.
pub(crate) struct ReservationGoal<'a> {
    pool: &'a RefCell<SegmentPool>,
    previous: usize,
}

impl<'a> ReservationGoal<'a> {
    pub fn new(pool: &'a RefCell<SegmentPool>, goal: usize) -> Self {
        let previous = pool.borrow_mut().set_current_emergency_reserve_goal(goal);
        Self { pool, previous }
    }
}

impl Drop for ReservationGoal<'_> {
    fn drop(&mut self) {
        self.pool
            .borrow_mut()
            .set_current_emergency_reserve_goal(self.previous);
    }
}

/// Forbids mapping new zones for its lifetime.
pub(crate) struct NoGrowth<'a> {
    pool: &'a RefCell<SegmentPool>,
    previous: bool,
}

impl<'a> NoGrowth<'a> {
    pub fn new(pool: &'a RefCell<SegmentPool>) -> Self {
        let previous = pool.borrow_mut().set_growth_allowed(false);
        Self { pool, previous }
    }
}

impl Drop for NoGrowth<'_> {
    fn drop(&mut self) {
        self.pool.borrow_mut().set_growth_allowed(self.previous);
    }
}

/// Raises the emergency reserve maximum for its lifetime.
pub(crate) struct ReserveLimit<'a> {
    pool: &'a RefCell<SegmentPool>,
    previous: usize,
}

impl<'a> ReserveLimit<'a> {
    pub fn raise(pool: &'a RefCell<SegmentPool>, segments: usize) -> Self {
        let mut guard = pool.borrow_mut();
        let previous = guard.emergency_reserve_max();
        guard.set_emergency_reserve_max(previous.max(segments));
        drop(guard);
        Self { pool, previous }
    }
}

impl Drop for ReserveLimit<'_> {
    fn drop(&mut self) {
        self.pool
            .borrow_mut()
            .set_emergency_reserve_max(self.previous);
    }
}
