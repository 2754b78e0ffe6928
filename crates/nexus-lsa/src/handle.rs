//! Object handles, the relocation trait and the shard-wide slot table.
//!
//! Objects in a region move whenever their segment is compacted, so clients
//! never hold raw pointers to them. A [`Handle`] names an object by a slot in
//! the tracker's [`SlotTable`]; the slot records where the object currently
//! lives and is rewritten on every relocation.
//!
//! ```text
//!   Handle { slot: 7, generation: 3 }
//!        │
//!        ▼
//!   SlotTable[7] = { owner: region 2, generation: 3, Small { segment: 4, offset: 832 } }
//!        │
//!        ▼
//!   segment 4 of region 2 ── descriptor @832 ── object bytes
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr;

use crate::region::RegionId;

// =============================================================================
// Relocation
// =============================================================================

/// A type that can live in a region and be moved by compaction.
///
/// Compaction moves an object by reading it out of its old location, calling
/// [`relocated`](Relocatable::relocated) on it, and writing the result into
/// the new location. The default implementation is a plain move, which is
/// correct for every type that does not hold pointers into itself.
///
/// `relocated` runs in the middle of compaction or reclaim and must not
/// allocate in, free from, or access any region.
pub trait Relocatable: Sized + 'static {
    /// Called once each time the object is moved to a new address.
    #[inline]
    fn relocated(self) -> Self {
        self
    }
}

macro_rules! impl_relocatable {
    ($($ty:ty),* $(,)?) => {
        $(impl Relocatable for $ty {})*
    };
}

impl_relocatable!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
);

impl<T: 'static> Relocatable for Vec<T> {}
impl<T: ?Sized + 'static> Relocatable for Box<T> {}
impl<T: Relocatable> Relocatable for Option<T> {
    fn relocated(self) -> Self {
        self.map(Relocatable::relocated)
    }
}
impl<T: Copy + 'static, const N: usize> Relocatable for [T; N] {}

/// Type-erased move and drop callbacks stored in every object descriptor.
pub(crate) struct ObjectVTable {
    /// Moves `size` bytes worth of object from `src` to `dst`. The source is
    /// logically uninitialized afterwards.
    pub(crate) relocate: unsafe fn(src: *mut u8, dst: *mut u8, size: usize),
    /// Drops the object in place.
    pub(crate) drop: unsafe fn(ptr: *mut u8, size: usize),
    /// Name of the stored type, for diagnostics.
    pub(crate) type_name: fn() -> &'static str,
}

impl fmt::Debug for ObjectVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectVTable")
            .field("type_name", &(self.type_name)())
            .finish()
    }
}

struct VTableOf<T>(PhantomData<T>);

impl<T: Relocatable> VTableOf<T> {
    const VTABLE: ObjectVTable = ObjectVTable {
        relocate: relocate_value::<T>,
        drop: drop_value::<T>,
        type_name: std::any::type_name::<T>,
    };
}

/// Returns the vtable of `T`.
#[inline]
pub(crate) fn vtable_of<T: Relocatable>() -> &'static ObjectVTable {
    &VTableOf::<T>::VTABLE
}

/// Vtable of untyped byte blobs.
pub(crate) static BYTES_VTABLE: ObjectVTable = ObjectVTable {
    relocate: relocate_bytes,
    drop: drop_bytes,
    type_name: bytes_type_name,
};

unsafe fn relocate_value<T: Relocatable>(src: *mut u8, dst: *mut u8, _size: usize) {
    let value = ptr::read(src.cast::<T>());
    ptr::write(dst.cast::<T>(), value.relocated());
}

unsafe fn drop_value<T>(ptr: *mut u8, _size: usize) {
    ptr::drop_in_place(ptr.cast::<T>());
}

unsafe fn relocate_bytes(src: *mut u8, dst: *mut u8, size: usize) {
    ptr::copy_nonoverlapping(src, dst, size);
}

unsafe fn drop_bytes(_ptr: *mut u8, _size: usize) {}

fn bytes_type_name() -> &'static str {
    "[u8]"
}

// =============================================================================
// Handles
// =============================================================================

/// Untyped identity of an object: a slot and the generation it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    slot: u32,
    generation: u32,
}

impl ObjectId {
    /// Returns the slot index.
    #[must_use]
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Returns the generation of the slot this id was issued in.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

/// Typed reference to an object allocated in a region.
///
/// A handle stays valid across compaction, reclaim and region merges. Once
/// the object is freed (or its region is dropped) the handle goes stale and
/// every lookup through it returns `None`; the slot may be reused, but with a
/// new generation.
pub struct Handle<T: ?Sized> {
    id: ObjectId,
    _marker: PhantomData<fn() -> *const T>,
}

impl<T: ?Sized> Handle<T> {
    pub(crate) fn new(id: ObjectId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Returns the untyped object id.
    #[must_use]
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Handle<T> {}

impl<T: ?Sized> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for Handle<T> {}

impl<T: ?Sized> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

// =============================================================================
// Slot Table
// =============================================================================

/// Current location of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// Inside a segment: region-local segment index and descriptor offset.
    Small { segment: u32, offset: u32 },
    /// Oversized object allocated from the global allocator.
    Large { address: usize },
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    owner: Option<RegionId>,
    location: Location,
}

/// Shard-wide indirection from object ids to object locations.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Issues an id for a new object.
    pub fn insert(&mut self, owner: RegionId, location: Location) -> ObjectId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.owner = Some(owner);
            entry.location = location;
            return ObjectId {
                slot,
                generation: entry.generation,
            };
        }
        assert!(self.slots.len() < u32::MAX as usize, "slot table exhausted");
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            owner: Some(owner),
            location,
        });
        ObjectId {
            slot,
            generation: 0,
        }
    }

    /// Resolves `id` for `owner`. Stale ids and ids of other regions resolve to `None`.
    pub fn resolve(&self, id: ObjectId, owner: RegionId) -> Option<Location> {
        let entry = self.slots.get(id.slot as usize)?;
        (entry.generation == id.generation && entry.owner == Some(owner)).then_some(entry.location)
    }

    /// Points `slot` at a new location.
    pub fn relocate(&mut self, slot: u32, location: Location) {
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.owner.is_some(), "relocating a free slot");
        entry.location = location;
    }

    /// Transfers `slot` to another region.
    pub fn transfer(&mut self, slot: u32, owner: RegionId, location: Location) {
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.owner.is_some(), "transferring a free slot");
        entry.owner = Some(owner);
        entry.location = location;
    }

    /// Retires the slot of `id`, invalidating every handle to it.
    pub fn remove(&mut self, id: ObjectId) -> Option<Location> {
        let entry = self.slots.get(id.slot as usize)?;
        if entry.generation != id.generation || entry.owner.is_none() {
            return None;
        }
        let location = entry.location;
        self.release(id.slot);
        Some(location)
    }

    /// Retires `slot` regardless of generation.
    pub fn release(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.owner.is_some(), "releasing a free slot");
        entry.owner = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        self.live -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u64) -> RegionId {
        RegionId::from_raw(id)
    }

    #[test]
    fn test_slot_lifecycle() {
        let mut table = SlotTable::new();
        let loc = Location::Small {
            segment: 1,
            offset: 64,
        };
        let id = table.insert(region(1), loc);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(id, region(1)), Some(loc));
        assert_eq!(table.resolve(id, region(2)), None);

        let moved = Location::Small {
            segment: 3,
            offset: 0,
        };
        table.relocate(id.slot(), moved);
        assert_eq!(table.resolve(id, region(1)), Some(moved));

        assert_eq!(table.remove(id), Some(moved));
        assert_eq!(table.len(), 0);
        assert_eq!(table.resolve(id, region(1)), None);
        assert_eq!(table.remove(id), None);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut table = SlotTable::new();
        let first = table.insert(region(1), Location::Large { address: 0x1000 });
        table.remove(first);

        let second = table.insert(region(1), Location::Large { address: 0x2000 });
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
        assert_eq!(table.resolve(first, region(1)), None);
        assert_eq!(
            table.resolve(second, region(1)),
            Some(Location::Large { address: 0x2000 })
        );
    }

    #[test]
    fn test_transfer() {
        let mut table = SlotTable::new();
        let id = table.insert(region(1), Location::Large { address: 0x1000 });
        table.transfer(
            id.slot(),
            region(2),
            Location::Small {
                segment: 0,
                offset: 8,
            },
        );
        assert_eq!(table.resolve(id, region(1)), None);
        assert!(table.resolve(id, region(2)).is_some());
    }

    #[test]
    fn test_vtable_relocation() {
        #[derive(Debug, PartialEq)]
        struct Counter(u32);
        impl Relocatable for Counter {
            fn relocated(self) -> Self {
                Counter(self.0 + 1)
            }
        }

        let vtable = vtable_of::<Counter>();
        assert!((vtable.type_name)().contains("Counter"));

        let mut src = std::mem::MaybeUninit::new(Counter(1));
        let mut dst = std::mem::MaybeUninit::<Counter>::uninit();
        unsafe {
            (vtable.relocate)(
                src.as_mut_ptr().cast(),
                dst.as_mut_ptr().cast(),
                std::mem::size_of::<Counter>(),
            );
            assert_eq!(dst.assume_init_ref(), &Counter(2));
            (vtable.drop)(dst.as_mut_ptr().cast(), std::mem::size_of::<Counter>());
        }
    }

    #[test]
    fn test_handle_is_copy_and_comparable() {
        let mut table = SlotTable::new();
        let id = table.insert(region(1), Location::Large { address: 8 });
        let a: Handle<String> = Handle::new(id);
        let b = a;
        assert_eq!(a, b);
        assert_eq!(format!("{a:?}"), format!("Handle({})", id));
    }
}
