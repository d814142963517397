//! Error types for shmstructs

use crate::prefix_tree::ValueType;
use std::io;
use thiserror::Error;

/// Result type for shmstructs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on pools, allocators, and trees
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup on a key that is absent or has no value
    #[error("key not found")]
    KeyNotFound,

    /// incr() against a value of an incompatible type
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: ValueType, found: ValueType },

    /// The allocator cannot satisfy the request, even after expanding the pool
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// Expansion would cross the pool's configured maximum size
    #[error("pool limit exceeded: {requested} bytes requested, maximum is {max_size}")]
    LimitExceeded { requested: u64, max_size: u64 },

    /// The named region exists but does not carry a compatible header
    #[error("pool '{name}' has an incompatible header")]
    IncompatiblePool { name: String },

    /// Pool name too long for the backing object namespace
    #[error("pool name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Failed to open or create the backing object
    #[error("failed to open pool '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to unlink the backing object
    #[error("failed to delete pool '{name}': {source}")]
    ShmUnlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to resize the backing object
    #[error("failed to set pool size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to map or remap the pool
    #[error("failed to map pool: {0}")]
    Mmap(#[source] io::Error),
}
