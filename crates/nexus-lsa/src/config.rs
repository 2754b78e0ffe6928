//! Allocator configuration.
//!
//! [`TrackerConfig`] holds the per-shard tunables of the segment pool,
//! compaction and reclaim. [`GroupConfig`] holds the limits of one region
//! group. Both are plain serde structs: they can be built in code with the
//! `with_*` methods, loaded from TOML, or (for the tracker) overridden from
//! `NEXUS_LSA_*` environment variables.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{MemoryError, MemoryResult};

/// Per-shard allocator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Segment size in bytes. Must be a power of two and at least the page size.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Upper bound on memory the shard may use. Defaults to physical memory.
    #[serde(default)]
    pub memory_limit: Option<usize>,

    /// Fraction of the memory limit that is never handed to the pool.
    #[serde(default = "default_min_free_memory_ratio")]
    pub min_free_memory_ratio: f64,

    /// Segments in the first zone mapped by the pool.
    #[serde(default = "default_zone_min_segments")]
    pub zone_min_segments: usize,

    /// Cap on the number of segments in one zone.
    #[serde(default = "default_zone_max_segments")]
    pub zone_max_segments: usize,

    /// Size the emergency reserve is refilled to.
    #[serde(default = "default_emergency_reserve_max")]
    pub emergency_reserve_max: usize,

    /// Reserve segments that ordinary allocations leave untouched.
    #[serde(default = "default_emergency_reserve_goal")]
    pub emergency_reserve_goal: usize,

    /// Reclaim requests are rounded up to this many segments.
    #[serde(default = "default_reclamation_step")]
    pub reclamation_step: usize,

    /// Objects above `segment_size * max_small_object_fraction` bypass the arena.
    #[serde(default = "default_max_small_object_fraction")]
    pub max_small_object_fraction: f64,

    /// Used-space ratio above which a region is not compacted.
    #[serde(default = "default_compaction_ratio")]
    pub max_used_space_ratio_for_compaction: f64,

    /// Used-space ratio above which a region is not compacted while idle.
    #[serde(default = "default_idle_compaction_ratio")]
    pub max_used_space_ratio_for_idle_compaction: f64,

    /// Abort the process instead of returning `OutOfMemory` for segment allocations.
    #[serde(default)]
    pub abort_on_bad_alloc: bool,
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

fn default_min_free_memory_ratio() -> f64 {
    DEFAULT_MIN_FREE_MEMORY_RATIO
}

fn default_zone_min_segments() -> usize {
    DEFAULT_ZONE_MIN_SEGMENTS
}

fn default_zone_max_segments() -> usize {
    DEFAULT_ZONE_MAX_SEGMENTS
}

fn default_emergency_reserve_max() -> usize {
    DEFAULT_EMERGENCY_RESERVE_MAX
}

fn default_emergency_reserve_goal() -> usize {
    DEFAULT_EMERGENCY_RESERVE_GOAL
}

fn default_reclamation_step() -> usize {
    DEFAULT_RECLAMATION_STEP
}

fn default_max_small_object_fraction() -> f64 {
    DEFAULT_MAX_SMALL_OBJECT_FRACTION
}

fn default_compaction_ratio() -> f64 {
    DEFAULT_MAX_USED_SPACE_RATIO_FOR_COMPACTION
}

fn default_idle_compaction_ratio() -> f64 {
    DEFAULT_MAX_USED_SPACE_RATIO_FOR_IDLE_COMPACTION
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            memory_limit: None,
            min_free_memory_ratio: default_min_free_memory_ratio(),
            zone_min_segments: default_zone_min_segments(),
            zone_max_segments: default_zone_max_segments(),
            emergency_reserve_max: default_emergency_reserve_max(),
            emergency_reserve_goal: default_emergency_reserve_goal(),
            reclamation_step: default_reclamation_step(),
            max_small_object_fraction: default_max_small_object_fraction(),
            max_used_space_ratio_for_compaction: default_compaction_ratio(),
            max_used_space_ratio_for_idle_compaction: default_idle_compaction_ratio(),
            abort_on_bad_alloc: false,
        }
    }
}

impl TrackerConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a small configuration suitable for tests.
    ///
    /// 64 KB segments, a 256 MB limit and a small emergency reserve.
    pub fn for_testing() -> Self {
        Self {
            segment_size: 64 * 1024,
            memory_limit: Some(256 * 1024 * 1024),
            min_free_memory_ratio: 0.0,
            zone_min_segments: 4,
            zone_max_segments: 64,
            emergency_reserve_max: 4,
            ..Self::default()
        }
    }

    /// Sets the segment size.
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the memory limit.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Sets the fraction of the memory limit kept out of the pool.
    pub fn with_min_free_memory_ratio(mut self, ratio: f64) -> Self {
        self.min_free_memory_ratio = ratio;
        self
    }

    /// Sets the zone growth bounds.
    pub fn with_zone_segments(mut self, min: usize, max: usize) -> Self {
        self.zone_min_segments = min;
        self.zone_max_segments = max;
        self
    }

    /// Sets the emergency reserve size, lowering the goal if it exceeds it.
    pub fn with_emergency_reserve(mut self, max: usize) -> Self {
        self.emergency_reserve_max = max;
        self.emergency_reserve_goal = self.emergency_reserve_goal.min(max);
        self
    }

    /// Sets the reclamation step in segments.
    pub fn with_reclamation_step(mut self, step: usize) -> Self {
        self.reclamation_step = step;
        self
    }

    /// Sets the oversized-object threshold as a fraction of the segment size.
    pub fn with_max_small_object_fraction(mut self, fraction: f64) -> Self {
        self.max_small_object_fraction = fraction;
        self
    }

    /// Sets the compaction thresholds.
    pub fn with_compaction_ratios(mut self, regular: f64, idle: f64) -> Self {
        self.max_used_space_ratio_for_compaction = regular;
        self.max_used_space_ratio_for_idle_compaction = idle;
        self
    }

    /// Enables or disables aborting on segment allocation failure.
    pub fn with_abort_on_bad_alloc(mut self, abort: bool) -> Self {
        self.abort_on_bad_alloc = abort;
        self
    }

    /// Parses a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MemoryError::config(e.to_string()))?;
        config.validate().map_err(MemoryError::config)?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> MemoryResult<String> {
        toml::to_string_pretty(self).map_err(|e| MemoryError::config(e.to_string()))
    }

    /// Returns the default configuration overridden from `NEXUS_LSA_*` variables.
    pub fn from_env() -> MemoryResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Applies `NEXUS_LSA_*` environment overrides on top of this configuration.
    pub fn with_env_overrides(mut self) -> MemoryResult<Self> {
        if let Some(size) = env_var("NEXUS_LSA_SEGMENT_SIZE")? {
            self.segment_size = size;
        }
        if let Some(limit) = env_var("NEXUS_LSA_MEMORY_LIMIT")? {
            self.memory_limit = Some(limit);
        }
        if let Some(step) = env_var("NEXUS_LSA_RECLAMATION_STEP")? {
            self.reclamation_step = step;
        }
        if let Some(abort) = env_var("NEXUS_LSA_ABORT_ON_BAD_ALLOC")? {
            self.abort_on_bad_alloc = abort;
        }
        if let Some(reserve) = env_var("NEXUS_LSA_EMERGENCY_RESERVE")? {
            self.emergency_reserve_max = reserve;
        }
        self.validate().map_err(MemoryError::config)?;
        Ok(self)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.segment_size.is_power_of_two() {
            return Err("segment_size must be a power of two");
        }
        if self.segment_size < MIN_SEGMENT_SIZE || self.segment_size < page_size() {
            return Err("segment_size must be at least the system page size");
        }
        if self.segment_size > MAX_SEGMENT_SIZE {
            return Err("segment_size exceeds the maximum segment size");
        }
        if self.memory_limit == Some(0) {
            return Err("memory_limit must be positive");
        }
        if !(0.0..1.0).contains(&self.min_free_memory_ratio) {
            return Err("min_free_memory_ratio must be in [0, 1)");
        }
        if self.zone_min_segments == 0 {
            return Err("zone_min_segments must be positive");
        }
        if self.zone_min_segments > self.zone_max_segments {
            return Err("zone_min_segments must not exceed zone_max_segments");
        }
        if self.emergency_reserve_goal > self.emergency_reserve_max {
            return Err("emergency_reserve_goal must not exceed emergency_reserve_max");
        }
        if self.reclamation_step == 0 {
            return Err("reclamation_step must be positive");
        }
        if !(self.max_small_object_fraction > 0.0 && self.max_small_object_fraction <= 0.5) {
            return Err("max_small_object_fraction must be in (0, 0.5]");
        }
        if !(self.max_used_space_ratio_for_compaction > 0.0
            && self.max_used_space_ratio_for_compaction <= 1.0)
        {
            return Err("max_used_space_ratio_for_compaction must be in (0, 1]");
        }
        if !(self.max_used_space_ratio_for_idle_compaction > 0.0
            && self.max_used_space_ratio_for_idle_compaction <= 1.0)
        {
            return Err("max_used_space_ratio_for_idle_compaction must be in (0, 1]");
        }
        Ok(())
    }

    /// Returns the memory limit, falling back to the physical memory size.
    pub fn effective_memory_limit(&self) -> usize {
        self.memory_limit.unwrap_or_else(physical_memory)
    }

    /// Returns the number of bytes kept out of the pool.
    pub fn min_free_memory(&self) -> usize {
        (self.effective_memory_limit() as f64 * self.min_free_memory_ratio) as usize
    }

    /// Returns the largest object size allocated inside segments.
    #[inline]
    pub fn max_small_object(&self) -> usize {
        (self.segment_size as f64 * self.max_small_object_fraction) as usize
    }
}

/// Configuration of one region group.
///
/// Limits are in bytes and count both segment memory and oversized objects
/// of every region in the group and its subgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Usage at or above which soft-pressure listeners are notified.
    #[serde(default = "unlimited")]
    pub soft_limit: usize,

    /// Usage above which admission of new requests is throttled.
    #[serde(default = "unlimited")]
    pub hard_limit: usize,

    /// Requests smaller than this are never queued.
    #[serde(default)]
    pub admission_threshold: usize,
}

fn unlimited() -> usize {
    usize::MAX
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl GroupConfig {
    /// A group with no limits. It only aggregates usage.
    pub fn unlimited() -> Self {
        Self {
            soft_limit: unlimited(),
            hard_limit: unlimited(),
            admission_threshold: 0,
        }
    }

    /// Sets the soft limit.
    pub fn with_soft_limit(mut self, limit: usize) -> Self {
        self.soft_limit = limit;
        self
    }

    /// Sets the hard (throttle) limit.
    pub fn with_hard_limit(mut self, limit: usize) -> Self {
        self.hard_limit = limit;
        self
    }

    /// Sets the admission threshold.
    pub fn with_admission_threshold(mut self, threshold: usize) -> Self {
        self.admission_threshold = threshold;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.soft_limit > self.hard_limit {
            return Err("soft_limit must not exceed hard_limit");
        }
        Ok(())
    }
}

// -----------------------------------------------------------------
// Private helpers
// -----------------------------------------------------------------

fn env_var<T: FromStr>(name: &str) -> MemoryResult<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MemoryError::config(format!("invalid value for {name}: '{value}'"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(MemoryError::config(format!("{name} is not valid unicode")))
        }
    }
}

/// Returns the system page size.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        MIN_SEGMENT_SIZE
    }
}

/// Returns the amount of physical memory on this machine.
pub(crate) fn physical_memory() -> usize {
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages > 0 {
        (pages as usize).saturating_mul(page_size())
    } else {
        FALLBACK_MEMORY_LIMIT
    }
}
