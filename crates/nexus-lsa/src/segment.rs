//! Segment layout.
//!
//! A segment is a fixed-size block aligned to its own size. Objects are
//! bump-allocated into it, each preceded by an [`ObjectDescriptor`]:
//!
//! ```text
//! +------+------------+-----+----------+------+------------+-----+--------+-----+
//! | lead | descriptor | pad | object 0 | lead | descriptor | pad | object | ... |
//! +------+------------+-----+----------+------+------------+-----+--------+-----+
//!         ^ 8-aligned        ^ aligned to the object's alignment
//! ```
//!
//! `lead` is the padding between the previous object's end and the
//! descriptor. A closed segment ends with a descriptor carrying the END flag
//! (if there is room for one), so the walker knows where the objects stop.

use std::fmt;
use std::mem;
use std::ptr::NonNull;

use crate::constants::DESCRIPTOR_ALIGN;
use crate::handle::ObjectVTable;

/// Size of an in-segment object descriptor.
pub(crate) const DESCRIPTOR_SIZE: usize = mem::size_of::<ObjectDescriptor>();

const FLAG_LIVE: u8 = 0x1;
const FLAG_END: u8 = 0x2;

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// =============================================================================
// Segment
// =============================================================================

/// Base address of one segment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Segment {
    base: NonNull<u8>,
}

impl Segment {
    /// Wraps a segment base address.
    pub fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns a pointer `offset` bytes into the segment.
    #[inline]
    pub fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers only pass offsets within the segment.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Reads the descriptor at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be 8-aligned and a descriptor must have been written there.
    #[inline]
    pub unsafe fn descriptor(&self, offset: usize) -> ObjectDescriptor {
        self.at(offset).cast::<ObjectDescriptor>().read()
    }

    /// Writes a descriptor at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be 8-aligned with room for a descriptor before the segment end.
    #[inline]
    pub unsafe fn write_descriptor(&self, offset: usize, descriptor: ObjectDescriptor) {
        self.at(offset).cast::<ObjectDescriptor>().write(descriptor);
    }

    /// Clears the live flag of the descriptor at `offset`, returning the old descriptor.
    ///
    /// # Safety
    ///
    /// Same as [`descriptor`](Self::descriptor).
    pub unsafe fn mark_dead(&self, offset: usize) -> ObjectDescriptor {
        let desc = self.descriptor(offset);
        let mut dead = desc;
        dead.flags &= !FLAG_LIVE;
        self.write_descriptor(offset, dead);
        desc
    }

    /// Terminates the object sequence of a segment whose bump offset is `offset`.
    pub fn write_end_marker(&self, offset: usize, segment_size: usize) {
        let at = align_up(offset, DESCRIPTOR_ALIGN);
        if at + DESCRIPTOR_SIZE <= segment_size {
            // SAFETY: `at` is aligned and the descriptor fits in the segment.
            unsafe { self.write_descriptor(at, ObjectDescriptor::end_marker()) };
        }
    }

    /// Iterates over the descriptors written below `limit`.
    pub fn objects(&self, limit: usize) -> ObjectIter {
        ObjectIter {
            segment: *self,
            offset: 0,
            limit,
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({:#x})", self.addr())
    }
}

// =============================================================================
// Object Descriptor
// =============================================================================

/// Header written in front of every object in a segment.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ObjectDescriptor {
    vtable: *const ObjectVTable,
    size: u32,
    slot: u32,
    lead: u16,
    align_shift: u8,
    flags: u8,
}

impl ObjectDescriptor {
    /// Descriptor of a live object.
    pub fn live(vtable: &'static ObjectVTable, size: usize, slot: u32, lead: usize, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self {
            vtable,
            size: size as u32,
            slot,
            lead: lead as u16,
            align_shift: align.trailing_zeros() as u8,
            flags: FLAG_LIVE,
        }
    }

    fn end_marker() -> Self {
        Self {
            vtable: std::ptr::null(),
            size: 0,
            slot: 0,
            lead: 0,
            align_shift: 0,
            flags: FLAG_END,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.flags & FLAG_LIVE != 0
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn align(&self) -> usize {
        1 << self.align_shift
    }

    /// Returns the vtable of the described object.
    pub fn vtable(&self) -> &'static ObjectVTable {
        debug_assert!(!self.vtable.is_null());
        // SAFETY: live descriptors always carry a pointer to a 'static vtable.
        unsafe { &*self.vtable }
    }

    /// Offset of the object, given that this descriptor sits at `at`.
    #[inline]
    pub fn object_offset(&self, at: usize) -> usize {
        align_up(at + DESCRIPTOR_SIZE, self.align())
    }

    /// Bytes the object occupies, lead padding included, given that this descriptor sits at `at`.
    #[inline]
    pub fn footprint(&self, at: usize) -> usize {
        self.lead as usize + self.object_offset(at) + self.size() - at
    }
}

impl fmt::Debug for ObjectDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDescriptor")
            .field("size", &self.size)
            .field("slot", &self.slot)
            .field("align", &self.align())
            .field("live", &self.is_live())
            .field("end", &self.is_end())
            .finish()
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Where an object of a given size and alignment lands when bump-allocated at some offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Offset of the descriptor.
    pub descriptor: usize,
    /// Offset of the object.
    pub object: usize,
    /// New bump offset.
    pub end: usize,
    /// Padding skipped before the descriptor.
    pub lead: usize,
}

impl Placement {
    /// Places an object at bump offset `offset`, or returns `None` if it does not fit.
    pub fn compute(offset: usize, size: usize, align: usize, segment_size: usize) -> Option<Self> {
        let descriptor = align_up(offset, DESCRIPTOR_ALIGN);
        let object = align_up(descriptor + DESCRIPTOR_SIZE, align);
        let end = object.checked_add(size)?;
        if end > segment_size {
            return None;
        }
        Some(Self {
            descriptor,
            object,
            end,
            lead: descriptor - offset,
        })
    }

    /// Bytes consumed from the segment by this placement.
    #[inline]
    pub fn footprint(&self, offset: usize) -> usize {
        self.end - offset
    }

    /// Upper bound on the footprint of an object, wherever it is placed.
    #[inline]
    pub fn worst_case(size: usize, align: usize) -> usize {
        DESCRIPTOR_ALIGN - 1 + DESCRIPTOR_SIZE + align - 1 + size
    }
}

// =============================================================================
// Object Iterator
// =============================================================================

/// Walks the descriptors of a segment, live and dead, in address order.
pub(crate) struct ObjectIter {
    segment: Segment,
    offset: usize,
    limit: usize,
}

impl Iterator for ObjectIter {
    /// Descriptor offset and descriptor.
    type Item = (usize, ObjectDescriptor);

    fn next(&mut self) -> Option<Self::Item> {
        let at = align_up(self.offset, DESCRIPTOR_ALIGN);
        if at + DESCRIPTOR_SIZE > self.limit {
            return None;
        }
        // SAFETY: every 8-aligned offset below the bump offset of a segment
        // that has not hit an end marker holds a descriptor.
        let desc = unsafe { self.segment.descriptor(at) };
        if desc.is_end() {
            return None;
        }
        self.offset = desc.object_offset(at) + desc.size();
        Some((at, desc))
    }
}
