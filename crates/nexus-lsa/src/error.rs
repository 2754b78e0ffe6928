//! Allocator errors.

use thiserror::Error;

/// Result type for allocator operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors that can occur while allocating or waiting for memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum MemoryError {
    /// The pool could not provide memory, even after reclaim, compaction and eviction.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// A request waiting for admission did not get through before its deadline.
    #[error("timed out after {duration_ms}ms waiting for memory")]
    Timeout { duration_ms: u64 },

    /// The region group a request was queued on has been dropped.
    #[error("region group '{group}' was shut down while a request was waiting")]
    GroupShutdown { group: String },

    /// The requested size and alignment do not form a valid layout.
    #[error("invalid layout: size {size}, alignment {align}")]
    InvalidLayout { size: usize, align: usize },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl MemoryError {
    /// Creates an out-of-memory error.
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::Timeout { .. })
    }

    /// Returns true if this is an out-of-memory error.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
