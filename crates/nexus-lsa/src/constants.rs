//! Allocator-wide constants.
//!
//! These values are the defaults used by [`TrackerConfig`](crate::TrackerConfig)
//! and [`AllocatingSection`](crate::AllocatingSection). Anything a deployment is
//! expected to tune lives in the configuration; the constants below only seed it.

// =============================================================================
// Segment Constants
// =============================================================================

/// Default segment size (128 KB).
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024;

/// Minimum segment size (4 KB). Must also be at least the system page size.
pub const MIN_SEGMENT_SIZE: usize = 4 * 1024;

/// Maximum segment size (16 MB).
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Objects larger than this fraction of a segment bypass the arena.
pub const DEFAULT_MAX_SMALL_OBJECT_FRACTION: f64 = 0.1;

/// Alignment of every in-segment object descriptor.
pub const DESCRIPTOR_ALIGN: usize = 8;

// =============================================================================
// Zone Constants
// =============================================================================

/// Number of segments in the first zone a pool maps.
pub const DEFAULT_ZONE_MIN_SEGMENTS: usize = 16;

/// Upper bound on the number of segments a single zone maps.
pub const DEFAULT_ZONE_MAX_SEGMENTS: usize = 4096;

// =============================================================================
// Pool Constants
// =============================================================================

/// Number of segments the emergency reserve is refilled to.
pub const DEFAULT_EMERGENCY_RESERVE_MAX: usize = 30;

/// Number of reserve segments ordinary allocations never consume.
pub const DEFAULT_EMERGENCY_RESERVE_GOAL: usize = 1;

/// Fraction of the memory limit kept free for the rest of the process.
pub const DEFAULT_MIN_FREE_MEMORY_RATIO: f64 = 0.05;

/// Memory limit assumed when the system cannot report its physical memory (64 GB).
pub const FALLBACK_MEMORY_LIMIT: usize = 64 * 1024 * 1024 * 1024;

// =============================================================================
// Reclaim and Compaction Constants
// =============================================================================

/// Minimum number of segments a reclaim request is rounded up to.
pub const DEFAULT_RECLAMATION_STEP: usize = 1;

/// Regions whose closed segments are fuller than this are not compacted.
pub const DEFAULT_MAX_USED_SPACE_RATIO_FOR_COMPACTION: f64 = 0.85;

/// Looser threshold applied while the shard is idle.
pub const DEFAULT_MAX_USED_SPACE_RATIO_FOR_IDLE_COMPACTION: f64 = 0.95;

// =============================================================================
// Allocating Section Constants
// =============================================================================

/// Segments an allocating section keeps in the emergency reserve.
pub const DEFAULT_LSA_RESERVE_SEGMENTS: usize = 10;

/// Bytes of general-purpose memory an allocating section keeps available.
pub const DEFAULT_STD_RESERVE_BYTES: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_constants() {
        assert!(DEFAULT_SEGMENT_SIZE.is_power_of_two());
        assert!(MIN_SEGMENT_SIZE.is_power_of_two());
        assert!(MAX_SEGMENT_SIZE.is_power_of_two());
        assert!(MIN_SEGMENT_SIZE <= DEFAULT_SEGMENT_SIZE);
        assert!(DEFAULT_SEGMENT_SIZE <= MAX_SEGMENT_SIZE);
    }

    #[test]
    fn test_compaction_ratios() {
        assert!(DEFAULT_MAX_USED_SPACE_RATIO_FOR_COMPACTION > 0.0);
        assert!(
            DEFAULT_MAX_USED_SPACE_RATIO_FOR_COMPACTION
                < DEFAULT_MAX_USED_SPACE_RATIO_FOR_IDLE_COMPACTION
        );
        assert!(DEFAULT_MAX_USED_SPACE_RATIO_FOR_IDLE_COMPACTION <= 1.0);
    }

    #[test]
    fn test_reserve_constants() {
        assert!(DEFAULT_EMERGENCY_RESERVE_GOAL <= DEFAULT_EMERGENCY_RESERVE_MAX);
        assert!(DEFAULT_ZONE_MIN_SEGMENTS <= DEFAULT_ZONE_MAX_SEGMENTS);
    }
}
