//! Zones: contiguous mappings carved into segments.
//!
//! A zone is one anonymous `mmap` aligned to the segment size. It tracks
//! which of its segments are handed out with a bitmap and remembers the
//! owner of each used segment so the pool can ask that owner to migrate it.
//! A zone only ever shrinks from its tail, by unmapping free segments at its
//! end.

use std::ptr::{self, NonNull};

use fixedbitset::FixedBitSet;
use tracing::warn;

use crate::region::RegionId;
use crate::segment::{align_up, Segment};

/// Region-side identity of a used segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentOwner {
    /// Owning region.
    pub region: RegionId,
    /// Index of the segment in the region's segment table.
    pub index: u32,
}

/// A contiguous, segment-aligned mapping.
pub(crate) struct Zone {
    base: NonNull<u8>,
    segment_size: usize,
    /// Segments currently mapped.
    len: usize,
    used: FixedBitSet,
    /// Free indices; the lowest index sits on top.
    free_list: Vec<u32>,
    owners: Vec<Option<SegmentOwner>>,
}

impl Zone {
    /// Maps a zone of `segments` segments, or returns `None` if the system refuses.
    pub fn create(segments: usize, segment_size: usize) -> Option<Self> {
        let len = segments.checked_mul(segment_size)?;
        let base = map_aligned(len, segment_size)?;
        let mut zone = Self {
            base,
            segment_size,
            len: segments,
            used: FixedBitSet::with_capacity(segments),
            free_list: Vec::with_capacity(segments),
            owners: vec![None; segments],
        };
        zone.rebuild_free_list();
        Some(zone)
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.len * self.segment_size
    }

    /// Mapped size in segments.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Mapped size in bytes.
    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.len * self.segment_size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.end_addr()
    }

    #[inline]
    pub fn has_free(&self) -> bool {
        !self.free_list.is_empty()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    #[inline]
    pub fn used_count(&self) -> usize {
        self.len - self.free_list.len()
    }

    pub fn is_used(&self, index: usize) -> bool {
        index < self.len && self.used.contains(index)
    }

    /// Returns the segment at `index`.
    pub fn segment(&self, index: usize) -> Segment {
        debug_assert!(index < self.len);
        // SAFETY: index is within the mapping, so the address is non-null and in bounds.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.segment_size)) };
        Segment::new(ptr)
    }

    /// Returns the index of the segment containing `addr`.
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr)
            .then(|| (addr - self.base_addr()) / self.segment_size)
    }

    /// Takes the lowest free segment.
    pub fn allocate(&mut self) -> Option<Segment> {
        let index = self.free_list.pop()? as usize;
        debug_assert!(!self.used.contains(index));
        self.used.insert(index);
        Some(self.segment(index))
    }

    /// Returns the segment at `index` to the free list.
    pub fn free(&mut self, index: usize) {
        assert!(self.is_used(index), "double free of zone segment {index}");
        self.used.set(index, false);
        self.owners[index] = None;
        self.free_list.push(index as u32);
    }

    pub fn owner(&self, index: usize) -> Option<SegmentOwner> {
        self.owners.get(index).copied().flatten()
    }

    pub fn set_owner(&mut self, index: usize, owner: Option<SegmentOwner>) {
        debug_assert!(self.is_used(index));
        self.owners[index] = owner;
    }

    /// Index of the highest used segment.
    pub fn highest_used(&self) -> Option<usize> {
        self.used.ones().filter(|&i| i < self.len).last()
    }

    /// Number of free segments at the end of the zone.
    pub fn free_tail(&self) -> usize {
        match self.highest_used() {
            Some(index) => self.len - index - 1,
            None => self.len,
        }
    }

    /// Unmaps up to `max_segments` free segments from the end of the zone.
    /// Returns the number of segments released.
    pub fn shrink(&mut self, max_segments: usize) -> usize {
        let released = self.free_tail().min(max_segments);
        if released == 0 {
            return 0;
        }
        let new_len = self.len - released;
        // SAFETY: the range lies inside our mapping and holds no used segment.
        unsafe {
            unmap(
                self.base.as_ptr().add(new_len * self.segment_size),
                released * self.segment_size,
            );
        }
        self.len = new_len;
        self.owners.truncate(new_len);
        self.rebuild_free_list();
        released
    }

    // -----------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------

    fn rebuild_free_list(&mut self) {
        self.free_list.clear();
        self.free_list.extend(
            (0..self.len)
                .rev()
                .filter(|&i| !self.used.contains(i))
                .map(|i| i as u32),
        );
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: base..base+len*S is our mapping.
            unsafe { unmap(self.base.as_ptr(), self.mapped_bytes()) };
        }
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("segments", &self.len)
            .field("used", &self.used_count())
            .finish()
    }
}

/// Maps `len` bytes aligned to `align`: over-maps by `align`, then trims
/// the unaligned head and the excess tail.
fn map_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
    let request = len.checked_add(align)?;
    // SAFETY: anonymous private mapping, no file descriptor involved.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            request,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let start = raw as usize;
    let aligned = align_up(start, align);
    let head = aligned - start;
    let tail = request - head - len;
    // SAFETY: head and tail are page-aligned pieces of the mapping we just made.
    unsafe {
        if head > 0 {
            unmap(raw.cast(), head);
        }
        if tail > 0 {
            unmap((aligned + len) as *mut u8, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

unsafe fn unmap(addr: *mut u8, len: usize) {
    if libc::munmap(addr.cast(), len) != 0 {
        warn!(
            addr = addr as usize,
            len,
            "munmap failed; the range stays mapped"
        );
    }
}
