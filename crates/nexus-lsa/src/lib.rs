//! # nexus-lsa
//!
//! Log-structured, compacting memory allocator for NexusDB shards.
//!
//! Memory is handed out in fixed-size segments carved from large `mmap`ed
//! zones. Regions bump-allocate objects into segments and compact sparse
//! segments by moving live objects, so fragmentation never strands memory.
//! This crate provides:
//! - A per-shard [`Tracker`] owning the segment pool, with reclaim that
//!   compacts, evicts and returns memory to the system on demand
//! - Compacting [`Region`]s with stable [`Handle`]s to movable objects
//! - Hierarchical [`RegionGroup`]s with soft and hard limits, pressure
//!   listeners and FIFO admission control
//! - [`AllocatingSection`]s that run allocations against reserved memory
//!
//! Everything here is single-threaded: one tracker per shard, used from one
//! thread.
//!
//! ```ignore
//! use nexus_lsa::{Region, Tracker, TrackerConfig};
//!
//! let tracker = Tracker::new(TrackerConfig::default())?;
//! let region = Region::new(&tracker);
//! let key = region.alloc_bytes(b"user:42", 1)?;
//! let value = region.alloc(String::from("hello"))?;
//! region.free(key);
//! region.compact();
//! assert_eq!(region.get(value).as_deref(), Some("hello"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Tracker and group configuration
pub mod config;

/// Default values and limits
pub mod constants;

/// Error types
pub mod error;

mod group;
mod handle;
mod heap;
mod occupancy;
mod pool;
mod region;
mod section;
mod segment;
mod tracker;
mod zone;

pub use config::{GroupConfig, TrackerConfig};
pub use error::{MemoryError, MemoryResult};
pub use group::{PressureListener, RegionGroup};
pub use handle::{Handle, ObjectId, Relocatable};
pub use occupancy::OccupancyStats;
pub use pool::PoolStats;
pub use region::{EvictionOutcome, Region, RegionId};
pub use section::AllocatingSection;
pub use tracker::{IdleCompaction, Tracker, TrackerStats};
