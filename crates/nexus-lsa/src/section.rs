//! Allocating sections.
//!
//! An allocating section runs a block of allocations against a region with
//! memory set aside up front: segments in the emergency reserve for region
//! allocations and free bytes under the memory limit for everything else.
//! Inside the block the region is pinned (no compaction, no migration), so
//! raw addresses obtained through `with`/`with_mut` stay meaningful between
//! calls in the block.
//!
//! When the block still runs out of memory, the section grows whichever
//! reserve fell short, so the next run sets more aside.

use std::cell::Cell;

use tracing::debug;

use crate::constants::{DEFAULT_LSA_RESERVE_SEGMENTS, DEFAULT_STD_RESERVE_BYTES};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::ReserveLimit;
use crate::region::Region;

/// Reserve-backed scope for allocations into a region.
#[derive(Debug)]
pub struct AllocatingSection {
    lsa_reserve: Cell<usize>,
    std_reserve: Cell<usize>,
}

impl Default for AllocatingSection {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatingSection {
    /// Creates a section with the default reserves.
    pub fn new() -> Self {
        Self {
            lsa_reserve: Cell::new(DEFAULT_LSA_RESERVE_SEGMENTS),
            std_reserve: Cell::new(DEFAULT_STD_RESERVE_BYTES),
        }
    }

    /// Segments kept in the emergency reserve while the section runs.
    #[must_use]
    pub fn lsa_reserve(&self) -> usize {
        self.lsa_reserve.get()
    }

    /// Sets the number of reserve segments for the next run.
    pub fn set_lsa_reserve(&self, segments: usize) {
        self.lsa_reserve.set(segments);
    }

    /// Free bytes kept under the memory limit while the section runs.
    #[must_use]
    pub fn std_reserve(&self) -> usize {
        self.std_reserve.get()
    }

    /// Sets the free bytes set aside for the next run.
    pub fn set_std_reserve(&self, bytes: usize) {
        self.std_reserve.set(bytes);
    }

    /// Runs `f` with the reserves in place and reclaiming disabled on `region`.
    pub fn run<R>(&self, region: &Region, f: impl FnOnce() -> MemoryResult<R>) -> MemoryResult<R> {
        let tracker = region.tracker();
        let _limit = ReserveLimit::raise(&tracker.inner().pool, self.lsa_reserve.get());

        let result = self
            .reserve(region)
            .and_then(|()| region.with_reclaiming_disabled(f));

        if let Err(MemoryError::OutOfMemory { requested }) = &result {
            if tracker.allocation_failure_flag() {
                self.lsa_reserve.set(self.lsa_reserve.get() * 2);
            } else {
                self.std_reserve.set(self.std_reserve.get() * 2);
            }
            debug!(
                region = %region.id(),
                requested,
                lsa_reserve = self.lsa_reserve.get(),
                std_reserve = self.std_reserve.get(),
                "allocating section ran out of memory, growing reserves"
            );
        }
        result
    }

    fn reserve(&self, region: &Region) -> MemoryResult<()> {
        let tracker = region.tracker();
        tracker.refill_emergency_reserve()?;
        let std_reserve = self.std_reserve.get();
        while tracker.free_memory() < std_reserve {
            if tracker.reclaim(std_reserve) == 0 {
                return Err(MemoryError::out_of_memory(std_reserve));
            }
        }
        tracker.clear_allocation_failure_flag();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::tracker::Tracker;

    const S: usize = 64 * 1024;

    #[test]
    fn test_run_pins_region() {
        let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
        let region = Region::new(&tracker);
        let section = AllocatingSection::new();

        let handle = section
            .run(&region, || {
                assert!(!region.reclaiming_enabled());
                region.alloc(5u32)
            })
            .unwrap();
        assert!(region.reclaiming_enabled());
        assert_eq!(region.get(handle), Some(5));
    }

    #[test]
    fn test_reserve_refilled_and_restored() {
        let tracker = Tracker::new(TrackerConfig::for_testing()).unwrap();
        let region = Region::new(&tracker);
        let section = AllocatingSection::new();
        section.set_lsa_reserve(6);

        section
            .run(&region, || {
                assert_eq!(tracker.pool_stats().reserve_segments, 6);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            tracker.inner().pool.borrow().emergency_reserve_max(),
            tracker.config().emergency_reserve_max
        );
    }

    #[test]
    fn test_out_of_memory_grows_lsa_reserve() {
        let config = TrackerConfig::for_testing()
            .with_memory_limit(8 * S)
            .with_zone_segments(1, 8)
            .with_emergency_reserve(1);
        let tracker = Tracker::new(config).unwrap();
        let region = Region::new(&tracker);
        let section = AllocatingSection::new();
        section.set_lsa_reserve(2);

        let err = section
            .run(&region, || {
                for i in 0..1_000_000u64 {
                    region.alloc(i)?;
                }
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(section.lsa_reserve(), 4);
        assert_eq!(section.std_reserve(), DEFAULT_STD_RESERVE_BYTES);
    }

    #[test]
    fn test_setters() {
        let section = AllocatingSection::default();
        assert_eq!(section.lsa_reserve(), DEFAULT_LSA_RESERVE_SEGMENTS);
        section.set_lsa_reserve(3);
        section.set_std_reserve(4096);
        assert_eq!(section.lsa_reserve(), 3);
        assert_eq!(section.std_reserve(), 4096);
    }
}
