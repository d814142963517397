//! shmstructs - Shared-memory data structures
//!
//! Typed containers that live inside a memory region shared between
//! cooperating processes on a single host, so multiple processes read and
//! mutate the same logical data without an IPC hop.
//!
//! # Architecture
//!
//! - **[`Pool`]**: a named, resizable, memory-mapped region addressed by
//!   byte offset; each process holds its own mapping and remaps lazily.
//! - **[`Allocator`]**: carves the pool into variable-size blocks, keeping
//!   its bookkeeping inside the pool. Two variants:
//!   [`SimpleAllocator`] (first-fit free list) and
//!   [`LogarithmicAllocator`] (power-of-two buddy system).
//! - **[`PrefixTree`]**: a typed key/value map over byte-string keys, stored
//!   as a trie of pool-resident nodes referenced by offset.
//!
//! # Concurrency
//!
//! Single Writer Multiple Readers (SWMR): readers run in parallel with each
//! other and with at most one writer, whose exclusivity is established by
//! external coordination. There is no in-pool lock. Handles are per-process
//! and per-thread.

pub mod allocator;
pub mod error;
pub mod logarithmic_allocator;
pub mod pool;
pub mod prefix_tree;
pub mod simple_allocator;

pub use allocator::Allocator;
pub use error::{Error, Result};
pub use logarithmic_allocator::LogarithmicAllocator;
pub use pool::Pool;
pub use prefix_tree::{PrefixTree, Value, ValueType};
pub use simple_allocator::SimpleAllocator;
