//! Allocator contract shared by every pool-resident allocator
//!
//! An allocator carves a [`Pool`] into variable-size blocks and keeps all of
//! its bookkeeping inside the pool, so any attached process sees the same
//! free lists. Two implementations exist with very different internals but
//! the same capability set: [`crate::SimpleAllocator`] (first-fit free list)
//! and [`crate::LogarithmicAllocator`] (power-of-two buddy system).

use crate::error::Result;
use crate::pool::{Pool, POOL_HEADER_SIZE};
use std::rc::Rc;

/// Offset of the allocator's pool-resident state, just past the pool header.
pub(crate) const ALLOCATOR_STATE_OFFSET: u64 = POOL_HEADER_SIZE;

/// Round up to the 8-byte allocation granularity.
#[inline]
pub(crate) fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Capability set of a pool-resident allocator.
///
/// Offsets returned by [`allocate`](Allocator::allocate) are nonzero and
/// aligned to at least 8 bytes; offset 0 doubles as the null reference.
/// A requested size of 0 yields a valid, distinct, freeable offset.
pub trait Allocator {
    /// Allocate a writable region of at least `size` bytes and return its
    /// pool offset. May grow the pool. Fails with
    /// [`Error::OutOfMemory`](crate::Error::OutOfMemory) when no sufficient
    /// block exists and the pool cannot be expanded.
    fn allocate(&self, size: u64) -> Result<u64>;

    /// Release a previously allocated region. `free(0)` is a no-op.
    /// Double-free is undefined behavior and is not detected.
    fn free(&self, offset: u64);

    /// Usable size of the block at `offset` (at least the requested size).
    fn block_size(&self, offset: u64) -> u64;

    /// Record the offset of the pool's root object so other processes can
    /// find it. 0 means unset.
    fn set_base_object_offset(&self, offset: u64);

    /// Offset of the pool's root object, or 0 when none has been registered.
    fn base_object_offset(&self) -> u64;

    /// Sum of the requested sizes of all live allocations.
    fn bytes_allocated(&self) -> u64;

    /// Total free bytes, including fragmentation.
    fn bytes_free(&self) -> u64;

    /// The pool this allocator carves.
    fn pool(&self) -> &Rc<Pool>;
}
