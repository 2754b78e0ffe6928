//! Regions: compacting bump allocators.
//!
//! A region allocates small objects by bumping an offset in its *active*
//! segment. When the active segment is full it is *closed* and a new one is
//! taken from the pool. Freed objects leave holes in closed segments; the
//! region keeps closed segments in a heap ordered by used space so the
//! sparsest one is always at hand for compaction, which moves its live
//! objects into the active segment and gives the emptied segment back.
//!
//! ```text
//!            closed (heap, sparsest first)                 active
//!   +---------------+ +---------------+ +---------------+  +-----------+------+
//!   | x . . x . . . | | x x . x x . x | | x x x x . x x |  | x x x x ->|      |
//!   +---------------+ +---------------+ +---------------+  +-----------+------+
//!        compact()  ------------- live objects moved ------------^
//! ```
//!
//! Objects above the small-object threshold are allocated from the global
//! allocator and tracked separately; they count towards occupancy and group
//! usage but are never moved.
//!
//! Every operation on a region runs while the region's `RefCell` is
//! mutably borrowed. The tracker uses `try_borrow_mut` to find out whether a
//! region is in the middle of something, and leaves it alone if so.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::config::TrackerConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::group::{GroupNode, RegionGroup};
use crate::handle::{vtable_of, Handle, Location, ObjectId, ObjectVTable, Relocatable, BYTES_VTABLE};
use crate::heap::IndexedHeap;
use crate::occupancy::OccupancyStats;
use crate::segment::{ObjectDescriptor, Placement, Segment};
use crate::tracker::{Tracker, TrackerImpl};
use crate::zone::SegmentOwner;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// Result of one call to a region's evictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Some memory was freed.
    Evicted,
    /// The region has nothing left to evict.
    NothingEvicted,
}

pub(crate) type Evictor = Rc<RefCell<Box<dyn FnMut() -> EvictionOutcome>>>;

// =============================================================================
// Region internals
// =============================================================================

#[derive(Debug)]
struct RegionSegment {
    segment: Segment,
    free_space: usize,
    live_objects: usize,
    /// Order in which the region took the segment. Indices are reused, serials are not.
    serial: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveSegment {
    index: u32,
    offset: usize,
}

struct LargeObject {
    slot: u32,
    size: usize,
    layout: Layout,
    vtable: &'static ObjectVTable,
}

/// Bookkeeping of one region. Always accessed through `Rc<RefCell<_>>`.
pub(crate) struct RegionImpl {
    id: RegionId,
    segment_size: usize,
    max_small_object: usize,
    segments: Vec<Option<RegionSegment>>,
    free_indices: Vec<u32>,
    /// Closed segments keyed by used space.
    closed: IndexedHeap<u32, usize>,
    closed_occupancy: OccupancyStats,
    active: Option<ActiveSegment>,
    /// Oversized objects keyed by address.
    large: HashMap<usize, LargeObject>,
    large_occupancy: OccupancyStats,
    object_count: usize,
    reclaiming_enabled: bool,
    evictor: Option<Evictor>,
    group: Option<Rc<GroupNode>>,
    reclaim_counter: u64,
    next_serial: u64,
}

impl RegionImpl {
    fn new(id: RegionId, config: &TrackerConfig, group: Option<Rc<GroupNode>>) -> Self {
        Self {
            id,
            segment_size: config.segment_size,
            max_small_object: config.max_small_object(),
            segments: Vec::new(),
            free_indices: Vec::new(),
            closed: IndexedHeap::new(),
            closed_occupancy: OccupancyStats::empty(),
            active: None,
            large: HashMap::new(),
            large_occupancy: OccupancyStats::empty(),
            object_count: 0,
            reclaiming_enabled: true,
            evictor: None,
            group,
            reclaim_counter: 0,
            next_serial: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn occupancy(&self) -> OccupancyStats {
        let mut occupancy = self.closed_occupancy + self.large_occupancy;
        if let Some(active) = self.active {
            occupancy += OccupancyStats::new(self.entry(active.index).free_space, self.segment_size);
        }
        occupancy
    }

    /// Memory held by the region: owned segments plus oversized objects.
    pub fn total_space(&self) -> usize {
        self.segment_count() * self.segment_size + self.large_occupancy.total_space()
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len() - self.free_indices.len()
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    #[inline]
    pub fn reclaim_counter(&self) -> u64 {
        self.reclaim_counter
    }

    #[inline]
    pub fn reclaiming_enabled(&self) -> bool {
        self.reclaiming_enabled
    }

    pub fn set_reclaiming_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.reclaiming_enabled, enabled)
    }

    pub fn evictor(&self) -> Option<Evictor> {
        self.evictor.clone()
    }

    /// Used space of the sparsest closed segment, or a full segment if none is closed.
    pub fn min_used_space(&self) -> usize {
        self.closed
            .peek()
            .map_or(self.segment_size, |(_, &used)| used)
    }

    pub fn is_compactible(&self, config: &TrackerConfig) -> bool {
        self.compactible_with(config.max_used_space_ratio_for_compaction, 2)
    }

    pub fn is_idle_compactible(&self, config: &TrackerConfig) -> bool {
        self.compactible_with(config.max_used_space_ratio_for_idle_compaction, 1)
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocates room for an object and writes it with `init`.
    pub fn alloc<F>(
        &mut self,
        tracker: &TrackerImpl,
        vtable: &'static ObjectVTable,
        size: usize,
        align: usize,
        init: F,
    ) -> MemoryResult<ObjectId>
    where
        F: FnOnce(*mut u8),
    {
        if !align.is_power_of_two() || size > isize::MAX as usize {
            return Err(MemoryError::InvalidLayout { size, align });
        }
        let id = if self.is_small(size, align) {
            self.alloc_small(tracker, vtable, size, align, init)?
        } else {
            self.alloc_large(tracker, vtable, size, align, init)?
        };
        self.object_count += 1;
        Ok(id)
    }

    /// Frees the object behind `id`. Returns false if `id` is stale or not ours.
    pub fn free(&mut self, tracker: &TrackerImpl, id: ObjectId) -> bool {
        let Some(location) = tracker.slots.borrow().resolve(id, self.id) else {
            return false;
        };
        tracker.slots.borrow_mut().remove(id);
        match location {
            Location::Small { segment, offset } => {
                self.free_small(tracker, segment, offset as usize)
            }
            Location::Large { address } => self.free_large(tracker, address),
        }
        self.object_count -= 1;
        true
    }

    /// Returns the address and size of the object behind `id`.
    pub fn resolve(&self, tracker: &TrackerImpl, id: ObjectId) -> Option<(*mut u8, usize)> {
        let location = tracker.slots.borrow().resolve(id, self.id)?;
        match location {
            Location::Small { segment, offset } => {
                let entry = self.segments.get(segment as usize)?.as_ref()?;
                // SAFETY: the slot table only points at live descriptors.
                let desc = unsafe { entry.segment.descriptor(offset as usize) };
                debug_assert!(desc.is_live());
                Some((
                    entry.segment.at(desc.object_offset(offset as usize)),
                    desc.size(),
                ))
            }
            Location::Large { address } => {
                let object = self.large.get(&address)?;
                Some((address as *mut u8, object.size))
            }
        }
    }

    // -----------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------

    /// Compacts sparse segments until the shard uses at least one segment
    /// less. Returns true if it got there.
    pub fn compact(&mut self, tracker: &TrackerImpl) -> bool {
        if !self.reclaiming_enabled {
            return false;
        }
        let before = tracker.pool.borrow().segments_in_use();
        while self.is_compactible(&tracker.config) {
            if !self.compact_one(tracker) {
                break;
            }
            if tracker.pool.borrow().segments_in_use() < before {
                return true;
            }
        }
        false
    }

    /// Compacts the sparsest closed segment.
    pub fn compact_one(&mut self, tracker: &TrackerImpl) -> bool {
        let Some((index, _)) = self.closed.peek() else {
            return false;
        };
        self.compact_segment(tracker, index)
    }

    /// Compacts every closed segment, packing all live objects together.
    pub fn full_compaction(&mut self, tracker: &TrackerImpl) {
        self.close_active(tracker);
        let mut order: Vec<(usize, u32, u64)> = self
            .closed
            .iter()
            .map(|(index, &used)| (used, index, self.entry(index).serial))
            .collect();
        order.sort_unstable();

        let before = self.segment_count();
        for (_, index, serial) in order {
            // Skip indices reused by destination segments of this pass.
            let original = self.segments[index as usize]
                .as_ref()
                .is_some_and(|entry| entry.serial == serial);
            if original && !self.compact_segment(tracker, index) {
                break;
            }
        }
        debug!(
            region = %self.id,
            before,
            after = self.segment_count(),
            "full compaction finished"
        );
    }

    /// Moves the contents of segment `index` from `src` to `dst`, at the same offsets.
    pub fn migrate_segment(&mut self, index: u32, src: Segment, dst: Segment) -> bool {
        if !self.reclaiming_enabled {
            return false;
        }
        let limit = self.walk_limit(index);
        let segment_size = self.segment_size;
        let Some(entry) = self.segments.get_mut(index as usize).and_then(Option::as_mut) else {
            return false;
        };
        if entry.segment != src {
            return false;
        }
        // SAFETY: both segments are segment_size bytes and distinct. The bulk
        // copy carries descriptors and dead space; live objects are then
        // moved properly through their vtables over the copied bytes.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), segment_size);
            for (at, desc) in src.objects(limit).filter(|(_, d)| d.is_live()) {
                let offset = desc.object_offset(at);
                (desc.vtable().relocate)(src.at(offset), dst.at(offset), desc.size());
            }
        }
        entry.segment = dst;
        self.reclaim_counter += 1;
        true
    }

    // -----------------------------------------------------------------
    // Merge and teardown
    // -----------------------------------------------------------------

    /// Moves everything `other` owns into this region.
    pub fn merge(&mut self, tracker: &TrackerImpl, other: &mut RegionImpl) {
        if let Some(active) = other.active {
            if other.entry(active.index).live_objects == 0 {
                other.active = None;
                other.release_segment(tracker, active.index);
            }
        }
        let moved_total = other.total_space();
        let other_active = other.active.take();

        let mut remap = HashMap::new();
        for (old_index, slot) in other.segments.iter_mut().enumerate() {
            let Some(mut entry) = slot.take() else {
                continue;
            };
            entry.serial = self.next_serial();
            let old_index = old_index as u32;
            let limit = match other_active {
                Some(active) if active.index == old_index => active.offset,
                _ => self.segment_size,
            };
            let segment = entry.segment;
            let new_index = self.insert_entry(entry);
            tracker.pool.borrow_mut().set_owner(
                segment,
                Some(SegmentOwner {
                    region: self.id,
                    index: new_index,
                }),
            );
            let mut slots = tracker.slots.borrow_mut();
            for (offset, desc) in segment.objects(limit).filter(|(_, d)| d.is_live()) {
                slots.transfer(
                    desc.slot(),
                    self.id,
                    Location::Small {
                        segment: new_index,
                        offset: offset as u32,
                    },
                );
            }
            drop(slots);
            remap.insert(old_index, new_index);
        }
        other.segments.clear();
        other.free_indices.clear();

        for (old_index, used) in other.closed.drain() {
            self.closed.push(remap[&old_index], used);
        }
        self.closed_occupancy += std::mem::take(&mut other.closed_occupancy);

        if let Some(active) = other_active {
            let active = ActiveSegment {
                index: remap[&active.index],
                offset: active.offset,
            };
            if self.active.is_none() {
                self.active = Some(active);
            } else {
                self.close_segment(tracker, active);
            }
        }

        let mut slots = tracker.slots.borrow_mut();
        for (address, object) in other.large.drain() {
            slots.transfer(object.slot, self.id, Location::Large { address });
            self.large.insert(address, object);
        }
        drop(slots);
        self.large_occupancy += std::mem::take(&mut other.large_occupancy);

        self.object_count += std::mem::take(&mut other.object_count);
        self.reclaim_counter = self.reclaim_counter.max(other.reclaim_counter);

        let same_group = match (&self.group, &other.group) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if let Some(group) = &other.group {
            group.resize_region(other.id, 0);
            if !same_group {
                group.update(-(moved_total as isize));
            }
        }
        if let Some(group) = &self.group {
            group.resize_region(self.id, self.total_space());
            if !same_group {
                group.update(moved_total as isize);
            }
        }
        debug!(region = %self.id, from = %other.id, bytes = moved_total, "merged regions");
    }

    /// Frees every object and returns every segment.
    pub fn clear(&mut self, tracker: &TrackerImpl) {
        let active = self.active.take();
        for index in 0..self.segments.len() as u32 {
            let Some(entry) = self.segments[index as usize].as_mut() else {
                continue;
            };
            let segment = entry.segment;
            entry.live_objects = 0;
            entry.free_space = self.segment_size;
            let limit = match active {
                Some(active) if active.index == index => active.offset,
                _ => self.segment_size,
            };
            for (at, desc) in segment.objects(limit).filter(|(_, d)| d.is_live()) {
                // SAFETY: live descriptor of an initialized object.
                unsafe {
                    segment.mark_dead(at);
                    (desc.vtable().drop)(segment.at(desc.object_offset(at)), desc.size());
                }
                tracker.slots.borrow_mut().release(desc.slot());
            }
        }
        self.closed.clear();
        self.closed_occupancy = OccupancyStats::empty();
        for index in 0..self.segments.len() as u32 {
            if self.segments[index as usize].is_some() {
                self.release_segment(tracker, index);
            }
        }

        let large: Vec<usize> = self.large.keys().copied().collect();
        for address in large {
            if let Some(object) = self.large.get(&address) {
                tracker.slots.borrow_mut().release(object.slot);
            }
            self.free_large(tracker, address);
        }
        self.object_count = 0;
    }

    // -----------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------

    fn entry(&self, index: u32) -> &RegionSegment {
        self.segments[index as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("{} has no segment {index}", self.id))
    }

    fn entry_mut(&mut self, index: u32) -> &mut RegionSegment {
        let id = self.id;
        self.segments[index as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("{id} has no segment {index}"))
    }

    fn is_small(&self, size: usize, align: usize) -> bool {
        size <= self.max_small_object
            && align <= self.max_small_object.max(crate::constants::DESCRIPTOR_ALIGN)
            && Placement::worst_case(size, align) <= self.segment_size
    }

    /// Bump offset past which a segment holds no descriptors.
    fn walk_limit(&self, index: u32) -> usize {
        match self.active {
            Some(active) if active.index == index => active.offset,
            _ => self.segment_size,
        }
    }

    fn compactible_with(&self, ratio: f64, slack_segments: usize) -> bool {
        if !self.reclaiming_enabled {
            return false;
        }
        let Some((_, &sparsest_used)) = self.closed.peek() else {
            return false;
        };
        let segment_size = self.segment_size;
        self.closed_occupancy.free_space() >= slack_segments * segment_size
            && self.closed_occupancy.used_fraction() < ratio
            && (segment_size - sparsest_used) as f64 >= segment_size as f64 * (1.0 - ratio)
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn insert_entry(&mut self, entry: RegionSegment) -> u32 {
        match self.free_indices.pop() {
            Some(index) => {
                self.segments[index as usize] = Some(entry);
                index
            }
            None => {
                self.segments.push(Some(entry));
                (self.segments.len() - 1) as u32
            }
        }
    }

    /// Takes ownership of a segment handed out by the pool.
    fn adopt_segment(&mut self, tracker: &TrackerImpl, segment: Segment) -> u32 {
        let serial = self.next_serial();
        let index = self.insert_entry(RegionSegment {
            segment,
            free_space: self.segment_size,
            live_objects: 0,
            serial,
        });
        tracker.pool.borrow_mut().set_owner(
            segment,
            Some(SegmentOwner {
                region: self.id,
                index,
            }),
        );
        self.notify_group(self.segment_size as isize);
        trace!(region = %self.id, segment = index, "segment acquired");
        index
    }

    fn release_segment(&mut self, tracker: &TrackerImpl, index: u32) {
        let entry = self.segments[index as usize]
            .take()
            .unwrap_or_else(|| panic!("{} released missing segment {index}", self.id));
        debug_assert_eq!(entry.live_objects, 0);
        self.free_indices.push(index);
        tracker.pool.borrow_mut().free_segment(entry.segment);
        self.notify_group(-(self.segment_size as isize));
        trace!(region = %self.id, segment = index, "segment released");
    }

    fn open_active(&mut self, tracker: &TrackerImpl) -> MemoryResult<()> {
        let segment = tracker.allocate_segment()?;
        let index = self.adopt_segment(tracker, segment);
        self.active = Some(ActiveSegment { index, offset: 0 });
        Ok(())
    }

    fn close_active(&mut self, tracker: &TrackerImpl) {
        if let Some(active) = self.active.take() {
            self.close_segment(tracker, active);
        }
    }

    fn close_segment(&mut self, tracker: &TrackerImpl, active: ActiveSegment) {
        let segment_size = self.segment_size;
        let entry = self.entry(active.index);
        let (segment, free_space, live_objects) = (entry.segment, entry.free_space, entry.live_objects);
        if live_objects == 0 {
            self.release_segment(tracker, active.index);
            return;
        }
        segment.write_end_marker(active.offset, segment_size);
        self.closed_occupancy += OccupancyStats::new(free_space, segment_size);
        self.closed.push(active.index, segment_size - free_space);
    }

    /// Finds room for an object, closing the active segment and opening a
    /// new one if needed. Returns the segment, the bump offset the object is
    /// placed at, and the placement.
    fn reserve_space(
        &mut self,
        tracker: &TrackerImpl,
        size: usize,
        align: usize,
    ) -> MemoryResult<(u32, usize, Placement)> {
        if let Some(active) = self.active {
            if let Some(placement) =
                Placement::compute(active.offset, size, align, self.segment_size)
            {
                return Ok((active.index, active.offset, placement));
            }
        }
        self.close_active(tracker);
        self.open_active(tracker)?;
        let index = self.active.map_or(0, |active| active.index);
        Placement::compute(0, size, align, self.segment_size)
            .map(|placement| (index, 0, placement))
            .ok_or(MemoryError::InvalidLayout { size, align })
    }

    fn alloc_small<F: FnOnce(*mut u8)>(
        &mut self,
        tracker: &TrackerImpl,
        vtable: &'static ObjectVTable,
        size: usize,
        align: usize,
        init: F,
    ) -> MemoryResult<ObjectId> {
        let (index, start, placement) = self.reserve_space(tracker, size, align)?;
        let segment = self.entry(index).segment;
        let id = tracker.slots.borrow_mut().insert(
            self.id,
            Location::Small {
                segment: index,
                offset: placement.descriptor as u32,
            },
        );
        // SAFETY: the placement was computed inside this segment, above the bump offset.
        unsafe {
            segment.write_descriptor(
                placement.descriptor,
                ObjectDescriptor::live(vtable, size, id.slot(), placement.lead, align),
            );
        }
        init(segment.at(placement.object));

        let entry = self.entry_mut(index);
        entry.free_space -= placement.footprint(start);
        entry.live_objects += 1;
        if let Some(active) = self.active.as_mut() {
            active.offset = placement.end;
        }
        Ok(id)
    }

    fn alloc_large<F: FnOnce(*mut u8)>(
        &mut self,
        tracker: &TrackerImpl,
        vtable: &'static ObjectVTable,
        size: usize,
        align: usize,
        init: F,
    ) -> MemoryResult<ObjectId> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| MemoryError::InvalidLayout { size, align })?;
        if !tracker.reserve_large(size) {
            warn!(region = %self.id, bytes = size, "oversized allocation exceeds memory limit");
            return Err(MemoryError::out_of_memory(size));
        }
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(MemoryError::out_of_memory(size));
        }
        init(ptr);

        let address = ptr as usize;
        let id = tracker
            .slots
            .borrow_mut()
            .insert(self.id, Location::Large { address });
        self.large.insert(
            address,
            LargeObject {
                slot: id.slot(),
                size,
                layout,
                vtable,
            },
        );
        self.large_occupancy += OccupancyStats::new(0, size);
        tracker.pool.borrow_mut().account_large(size);
        self.notify_group(size as isize);
        Ok(id)
    }

    fn free_small(&mut self, tracker: &TrackerImpl, index: u32, at: usize) {
        let segment_size = self.segment_size;
        let segment = self.entry(index).segment;
        debug_assert_eq!(
            tracker.pool.borrow().segment_containing(segment.at(at) as usize),
            Some(segment)
        );
        // SAFETY: the slot table pointed at this live descriptor; it is
        // marked dead before the object is dropped.
        let desc = unsafe { segment.mark_dead(at) };
        debug_assert!(desc.is_live());
        unsafe { (desc.vtable().drop)(segment.at(desc.object_offset(at)), desc.size()) };

        let footprint = desc.footprint(at);
        let entry = self.entry_mut(index);
        entry.free_space += footprint;
        entry.live_objects -= 1;
        let (free_space, live_objects) = (entry.free_space, entry.live_objects);

        if let Some(active) = self.active.as_mut() {
            if active.index == index {
                if live_objects == 0 {
                    debug_assert_eq!(free_space, segment_size);
                    active.offset = 0;
                }
                return;
            }
        }

        self.closed_occupancy.release(footprint);
        if live_objects == 0 {
            self.closed.remove(index);
            self.closed_occupancy -= OccupancyStats::new(segment_size, segment_size);
            self.release_segment(tracker, index);
        } else {
            self.closed.update(index, segment_size - free_space);
        }
    }

    fn free_large(&mut self, tracker: &TrackerImpl, address: usize) {
        let Some(object) = self.large.remove(&address) else {
            return;
        };
        let ptr = address as *mut u8;
        // SAFETY: allocated by alloc_large with this layout and still initialized.
        unsafe {
            (object.vtable.drop)(ptr, object.size);
            alloc::dealloc(ptr, object.layout);
        }
        self.large_occupancy -= OccupancyStats::new(0, object.size);
        tracker.pool.borrow_mut().release_large(object.size);
        self.notify_group(-(object.size as isize));
    }

    /// Moves the live objects of closed segment `index` into the active
    /// segment (and fresh segments after it), then frees the segment.
    ///
    /// Destination space is reserved up front; if it cannot be, the segment
    /// is left untouched and false is returned.
    fn compact_segment(&mut self, tracker: &TrackerImpl, index: u32) -> bool {
        if !self.closed.contains(index) {
            return false;
        }
        let segment_size = self.segment_size;
        let source = self.entry(index).segment;
        let live: Vec<(usize, ObjectDescriptor)> = source
            .objects(segment_size)
            .filter(|(_, desc)| desc.is_live())
            .collect();

        let worst = |desc: &ObjectDescriptor| Placement::worst_case(desc.size(), desc.align());
        let largest = live.iter().map(|(_, d)| worst(d)).max().unwrap_or(0);
        let needed: usize = live.iter().map(|(_, d)| worst(d)).sum();
        let mut capacity = self
            .active
            .map_or(0, |active| (segment_size - active.offset).saturating_sub(largest));
        let mut spares = Vec::new();
        while capacity < needed {
            match tracker.allocate_compaction_segment() {
                Some(segment) => {
                    spares.push(segment);
                    capacity += segment_size - largest;
                }
                None => {
                    let mut pool = tracker.pool.borrow_mut();
                    for spare in spares {
                        pool.free_segment(spare);
                    }
                    trace!(region = %self.id, segment = index, "no room to compact segment");
                    return false;
                }
            }
        }

        self.closed.remove(index);
        let source_free = self.entry(index).free_space;
        self.closed_occupancy -= OccupancyStats::new(source_free, segment_size);

        let moved = live.len();
        let mut spares = spares.into_iter();
        for (at, desc) in live {
            let (size, align) = (desc.size(), desc.align());
            let (dst_index, start, placement) = loop {
                if let Some(active) = self.active {
                    if let Some(placement) =
                        Placement::compute(active.offset, size, align, segment_size)
                    {
                        break (active.index, active.offset, placement);
                    }
                }
                self.close_active(tracker);
                let spare = spares.next().unwrap_or_else(|| {
                    panic!("compaction of {} segment {index} ran out of room", self.id)
                });
                let new_index = self.adopt_segment(tracker, spare);
                self.active = Some(ActiveSegment {
                    index: new_index,
                    offset: 0,
                });
            };

            let dst = self.entry(dst_index).segment;
            // SAFETY: the source descriptor is live and initialized; the
            // destination placement is unused space above the bump offset.
            unsafe {
                dst.write_descriptor(
                    placement.descriptor,
                    ObjectDescriptor::live(desc.vtable(), size, desc.slot(), placement.lead, align),
                );
                source.mark_dead(at);
                (desc.vtable().relocate)(
                    source.at(desc.object_offset(at)),
                    dst.at(placement.object),
                    size,
                );
            }

            let entry = self.entry_mut(dst_index);
            entry.free_space -= placement.footprint(start);
            entry.live_objects += 1;
            if let Some(active) = self.active.as_mut() {
                active.offset = placement.end;
            }
            tracker.slots.borrow_mut().relocate(
                desc.slot(),
                Location::Small {
                    segment: dst_index,
                    offset: placement.descriptor as u32,
                },
            );
        }

        let entry = self.entry_mut(index);
        entry.live_objects = 0;
        entry.free_space = segment_size;
        self.release_segment(tracker, index);
        {
            let mut pool = tracker.pool.borrow_mut();
            for spare in spares {
                pool.free_segment(spare);
            }
        }
        self.reclaim_counter += 1;
        tracker.record_segment_compacted();
        trace!(region = %self.id, segment = index, objects = moved, "segment compacted");
        true
    }

    fn notify_group(&self, delta: isize) {
        if let Some(group) = &self.group {
            group.resize_region(self.id, self.total_space());
            group.update(delta);
        }
    }
}

// =============================================================================
// Region
// =============================================================================

/// A compacting arena.
///
/// Objects are allocated with [`alloc`](Self::alloc) or
/// [`alloc_bytes`](Self::alloc_bytes) and accessed through the returned
/// [`Handle`]. Compaction may move objects at any point where no closure
/// passed to [`with`](Self::with) or [`with_mut`](Self::with_mut) is
/// running.
///
/// Dropping a region frees every object still in it.
///
/// # Panics
///
/// Region methods that modify the region panic when called from inside a
/// `with`/`with_mut` closure (or an object destructor) of the same region.
pub struct Region {
    tracker: Tracker,
    inner: Rc<RefCell<RegionImpl>>,
}

impl Region {
    /// Creates a region registered with `tracker`.
    pub fn new(tracker: &Tracker) -> Self {
        Self::build(tracker, None)
    }

    /// Creates a region whose memory is accounted to `group`.
    pub fn with_group(tracker: &Tracker, group: &RegionGroup) -> Self {
        Self::build(tracker, Some(Rc::clone(group.node())))
    }

    fn build(tracker: &Tracker, group: Option<Rc<GroupNode>>) -> Self {
        let id = RegionId::next();
        let inner = Rc::new(RefCell::new(RegionImpl::new(
            id,
            tracker.config(),
            group.clone(),
        )));
        tracker.inner().register(id, Rc::downgrade(&inner));
        if let Some(group) = &group {
            group.add_region(id);
        }
        trace!(region = %id, "region created");
        Self {
            tracker: tracker.clone(),
            inner,
        }
    }

    /// Returns the region id.
    #[must_use]
    pub fn id(&self) -> RegionId {
        self.inner.borrow().id()
    }

    /// Returns the tracker this region belongs to.
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Allocates `value` in the region.
    pub fn alloc<T: Relocatable>(&self, value: T) -> MemoryResult<Handle<T>> {
        let layout = Layout::new::<T>();
        let id = self.inner.borrow_mut().alloc(
            self.tracker.inner(),
            vtable_of::<T>(),
            layout.size(),
            layout.align(),
            // SAFETY: the region hands out a properly aligned, unused slot of `size_of::<T>()` bytes.
            |ptr| unsafe { ptr.cast::<T>().write(value) },
        )?;
        Ok(Handle::new(id))
    }

    /// Copies `data` into the region with the given alignment.
    pub fn alloc_bytes(&self, data: &[u8], align: usize) -> MemoryResult<Handle<[u8]>> {
        let len = data.len();
        let id = self.inner.borrow_mut().alloc(
            self.tracker.inner(),
            &BYTES_VTABLE,
            len,
            align,
            // SAFETY: the destination has room for `len` bytes and cannot overlap `data`.
            |ptr| unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr, len) },
        )?;
        Ok(Handle::new(id))
    }

    /// Frees the object behind `handle`. Returns false if the handle is stale.
    pub fn free<T: ?Sized>(&self, handle: Handle<T>) -> bool {
        self.inner
            .borrow_mut()
            .free(self.tracker.inner(), handle.id())
    }

    /// Runs `f` on the object behind `handle`.
    pub fn with<T: Relocatable, R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let region = self.inner.borrow();
        let (ptr, _) = region.resolve(self.tracker.inner(), handle.id())?;
        // SAFETY: the handle is live and typed; holding the borrow prevents
        // compaction and frees for the duration of `f`.
        let value = unsafe { &*ptr.cast::<T>() };
        let result = f(value);
        drop(region);
        Some(result)
    }

    /// Runs `f` on the object behind `handle` with mutable access.
    pub fn with_mut<T: Relocatable, R>(
        &self,
        handle: Handle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let region = self.inner.borrow_mut();
        let (ptr, _) = region.resolve(self.tracker.inner(), handle.id())?;
        // SAFETY: as in `with`; the exclusive borrow rules out any other
        // reference into the region while `f` runs.
        let value = unsafe { &mut *ptr.cast::<T>() };
        let result = f(value);
        drop(region);
        Some(result)
    }

    /// Runs `f` on the bytes behind `handle`.
    pub fn with_bytes<R>(&self, handle: Handle<[u8]>, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let region = self.inner.borrow();
        let (ptr, len) = region.resolve(self.tracker.inner(), handle.id())?;
        // SAFETY: `len` initialized bytes live at `ptr` while the borrow is held.
        let bytes = unsafe { slice::from_raw_parts(ptr.cast_const(), len) };
        let result = f(bytes);
        drop(region);
        Some(result)
    }

    /// Returns a clone of the object behind `handle`.
    pub fn get<T: Relocatable + Clone>(&self, handle: Handle<T>) -> Option<T> {
        self.with(handle, T::clone)
    }

    /// Returns the size in bytes of the object behind `handle`.
    pub fn size_of<T: ?Sized>(&self, handle: Handle<T>) -> Option<usize> {
        self.inner
            .borrow()
            .resolve(self.tracker.inner(), handle.id())
            .map(|(_, size)| size)
    }

    /// Returns true if `handle` refers to a live object of this region.
    pub fn contains<T: ?Sized>(&self, handle: Handle<T>) -> bool {
        self.size_of(handle).is_some()
    }

    /// Returns the region's occupancy, oversized objects included.
    pub fn occupancy(&self) -> OccupancyStats {
        self.inner.borrow().occupancy()
    }

    /// Compacts until the shard uses at least one segment less, or the
    /// region is no longer worth compacting. Returns true on success.
    pub fn compact(&self) -> bool {
        self.inner.borrow_mut().compact(self.tracker.inner())
    }

    /// Packs all live objects together, whatever the occupancy.
    pub fn full_compaction(&self) {
        self.inner.borrow_mut().full_compaction(self.tracker.inner());
    }

    /// Returns true if compaction would pay off.
    pub fn is_compactible(&self) -> bool {
        self.inner.borrow().is_compactible(self.tracker.config())
    }

    /// Returns true if idle-time compaction would pay off.
    pub fn is_idle_compactible(&self) -> bool {
        self.inner.borrow().is_idle_compactible(self.tracker.config())
    }

    /// Enables or disables compaction and migration of this region.
    pub fn set_reclaiming_enabled(&self, enabled: bool) {
        self.inner.borrow_mut().set_reclaiming_enabled(enabled);
    }

    /// Returns true unless compaction and migration are disabled.
    #[must_use]
    pub fn reclaiming_enabled(&self) -> bool {
        self.inner.borrow().reclaiming_enabled()
    }

    /// Runs `f` with compaction and migration of this region disabled.
    pub fn with_reclaiming_disabled<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.inner.borrow_mut().set_reclaiming_enabled(false);
        let _restore = RestoreReclaiming {
            region: &self.inner,
            previous,
        };
        f()
    }

    /// Installs an evictor the tracker calls when compaction alone cannot
    /// free enough memory.
    pub fn make_evictable<F>(&self, evictor: F)
    where
        F: FnMut() -> EvictionOutcome + 'static,
    {
        self.inner.borrow_mut().evictor = Some(Rc::new(RefCell::new(Box::new(evictor))));
    }

    /// Removes the evictor.
    pub fn make_not_evictable(&self) {
        self.inner.borrow_mut().evictor = None;
    }

    /// Returns true if an evictor is installed.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.inner.borrow().evictor.is_some()
    }

    /// Absorbs `other`: its objects, segments and accounting move here and
    /// its handles stay valid, now resolving through this region.
    ///
    /// # Panics
    ///
    /// Panics if `other` belongs to a different tracker.
    pub fn merge(&self, other: Region) {
        assert!(
            self.tracker.ptr_eq(&other.tracker),
            "cannot merge regions of different trackers"
        );
        {
            let mut this = self.inner.borrow_mut();
            let mut that = other.inner.borrow_mut();
            this.merge(self.tracker.inner(), &mut that);
        }
        drop(other);
    }

    /// Number of times objects of this region were moved.
    pub fn reclaim_counter(&self) -> u64 {
        self.inner.borrow().reclaim_counter()
    }

    /// Live objects, oversized ones included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.borrow().object_count()
    }

    /// Segments owned by the region.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.borrow().segment_count()
    }

    /// Frees every object, invalidating every handle into this region.
    pub fn clear(&self) {
        self.inner.borrow_mut().clear(self.tracker.inner());
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(region) => f
                .debug_struct("Region")
                .field("id", &region.id)
                .field("objects", &region.object_count)
                .field("segments", &region.segment_count())
                .field("occupancy", &region.occupancy())
                .finish(),
            Err(_) => f.debug_struct("Region").finish_non_exhaustive(),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let tracker = self.tracker.inner();
        let (id, group) = {
            let mut region = self.inner.borrow_mut();
            if region.object_count > 0 {
                warn!(
                    region = %region.id,
                    objects = region.object_count,
                    "region dropped with live objects"
                );
            }
            region.clear(tracker);
            assert_eq!(
                region.segment_count(),
                0,
                "{} still owns segments after teardown",
                region.id
            );
            assert!(region.large.is_empty(), "{} leaked oversized objects", region.id);
            (region.id, region.group.take())
        };
        if let Some(group) = group {
            group.remove_region(id);
        }
        tracker.unregister(id);
        trace!(region = %id, "region destroyed");
    }
}

struct RestoreReclaiming<'a> {
    region: &'a RefCell<RegionImpl>,
    previous: bool,
}

impl Drop for RestoreReclaiming<'_> {
    fn drop(&mut self) {
        self.region
            .borrow_mut()
            .set_reclaiming_enabled(self.previous);
    }
}
