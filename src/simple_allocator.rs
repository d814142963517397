//! First-fit allocator over a single pool-resident free list
//!
//! The free list is an intrusive doubly-linked list of free blocks sorted by
//! ascending offset. Allocation walks the list for the first sufficient
//! block, splitting off the tail when the remainder is big enough to stand
//! alone; freeing re-threads the block in sorted position and coalesces with
//! both neighbors. Both operations are O(F) in the number of free blocks,
//! which is acceptable for modest allocation counts or long-lived
//! allocations.

use crate::allocator::{align8, Allocator, ALLOCATOR_STATE_OFFSET};
use crate::error::{Error, Result};
use crate::pool::Pool;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocated block header: one word holding the requested size, plus (in
/// the top two bits) the slack granules absorbed when a whole block was
/// handed out because its remainder could not stand alone as a free block.
const ALLOC_HEADER_SIZE: u64 = 8;
const SLACK_SHIFT: u32 = 62;
const REQUESTED_MASK: u64 = (1 << SLACK_SHIFT) - 1;

/// Free block header `{prev, next, size}`; also the minimum block extent,
/// so any allocated block can be re-threaded as a free block.
const FREE_HEADER_SIZE: u64 = 24;

#[inline]
fn pack_header(requested: u64, slack: u64) -> u64 {
    requested | ((slack / 8) << SLACK_SHIFT)
}

#[inline]
fn unpack_header(word: u64) -> (u64, u64) {
    (word & REQUESTED_MASK, (word >> SLACK_SHIFT) * 8)
}

/// Pool-resident allocator state, at a fixed offset past the pool header.
/// Part of the cross-process ABI.
#[repr(C)]
struct State {
    initialized: AtomicU64,
    base_object_offset: AtomicU64,
    /// Sum of requested sizes of live allocations.
    bytes_allocated: AtomicU64,
    /// Same, plus block headers and alignment padding.
    bytes_committed: AtomicU64,
    bytes_free: AtomicU64,
    free_head: AtomicU64,
    free_tail: AtomicU64,
}

/// Intrusive header of a free block. `size` is the total extent in bytes,
/// header included.
#[repr(C)]
struct FreeBlock {
    prev: u64,
    next: u64,
    size: u64,
}

const ARENA_BASE: u64 = ALLOCATOR_STATE_OFFSET + std::mem::size_of::<State>() as u64;

/// Minimum extent of a block serving a request of `n` bytes. The true
/// extent of a live block is this plus the slack recorded in its header.
#[inline]
fn block_extent(requested: u64) -> u64 {
    (ALLOC_HEADER_SIZE + align8(requested)).max(FREE_HEADER_SIZE)
}

/// First-fit free-list allocator. See the module docs.
pub struct SimpleAllocator {
    pool: Rc<Pool>,
}

impl SimpleAllocator {
    /// Attach to (or initialize) the allocator state of `pool`.
    ///
    /// The first attacher initializes the free list to one block covering
    /// the arena; later attachers see the published state. Attaching an
    /// allocator of a different variant to the same pool is undefined.
    pub fn attach(pool: Rc<Pool>) -> Result<Self> {
        if pool.size() < ARENA_BASE + FREE_HEADER_SIZE {
            pool.expand(ARENA_BASE + FREE_HEADER_SIZE)?;
        }
        let alloc = Self { pool };
        if alloc.state().initialized.load(Ordering::Acquire) == 0 {
            let pool_size = alloc.pool.size();
            let arena_size = pool_size - ARENA_BASE;
            unsafe {
                *alloc.pool.at::<FreeBlock>(ARENA_BASE) = FreeBlock {
                    prev: 0,
                    next: 0,
                    size: arena_size,
                };
            }
            let state = alloc.state();
            state.free_head.store(ARENA_BASE, Ordering::Relaxed);
            state.free_tail.store(ARENA_BASE, Ordering::Relaxed);
            state.bytes_free.store(arena_size, Ordering::Relaxed);
            state.initialized.store(1, Ordering::Release);
        }
        Ok(alloc)
    }

    fn state(&self) -> &State {
        // The reference must not be held across a pool expansion; callers
        // re-fetch after any operation that can remap.
        unsafe { &*self.pool.at::<State>(ALLOCATOR_STATE_OFFSET) }
    }

    fn free_block(&self, offset: u64) -> *mut FreeBlock {
        self.pool.at::<FreeBlock>(offset)
    }

    /// Carve the chosen free block, which the caller has checked holds at
    /// least `extent` bytes. The tail is split off when it can stand alone
    /// as a free block; otherwise the whole block is handed out and the
    /// absorbed slack is recorded in the header.
    fn take_block(&self, offset: u64, requested: u64, extent: u64) {
        let (prev, next, size) = unsafe {
            let blk = &*self.free_block(offset);
            (blk.prev, blk.next, blk.size)
        };

        let (taken, replacement) = if size >= extent + FREE_HEADER_SIZE {
            // Split: the tail stays free at a new offset with the same links.
            let tail = offset + extent;
            unsafe {
                *self.free_block(tail) = FreeBlock {
                    prev,
                    next,
                    size: size - extent,
                };
            }
            (extent, tail)
        } else {
            (size, 0)
        };

        // Unlink the block (or relink neighbors to the split tail).
        let state = self.state();
        let successor = if replacement != 0 { replacement } else { next };
        if prev == 0 {
            state.free_head.store(successor, Ordering::Relaxed);
        } else {
            unsafe { (*self.free_block(prev)).next = successor };
        }
        if replacement != 0 {
            if next != 0 {
                unsafe { (*self.free_block(next)).prev = replacement };
            } else {
                state.free_tail.store(replacement, Ordering::Relaxed);
            }
        } else if next != 0 {
            unsafe { (*self.free_block(next)).prev = prev };
        } else {
            state.free_tail.store(prev, Ordering::Relaxed);
        }

        unsafe {
            *self.pool.at::<u64>(offset) = pack_header(requested, taken - extent);
        }
        state.bytes_allocated.fetch_add(requested, Ordering::Relaxed);
        state.bytes_committed.fetch_add(taken, Ordering::Relaxed);
        state.bytes_free.fetch_sub(taken, Ordering::Relaxed);
    }

    /// Return the region `[start, start + size)` to the free list, keeping
    /// it sorted by offset and coalescing with both neighbors.
    fn insert_free_region(&self, start: u64, mut size: u64) {
        // Find the first free block past the region.
        let mut next = self.state().free_head.load(Ordering::Relaxed);
        let mut prev = 0;
        while next != 0 && next < start {
            prev = next;
            next = unsafe { (*self.free_block(next)).next };
        }

        // Coalesce with the successor.
        if next != 0 && start + size == next {
            let (n_next, n_size) = unsafe {
                let blk = &*self.free_block(next);
                (blk.next, blk.size)
            };
            size += n_size;
            next = n_next;
        }

        let state = self.state();
        state.bytes_free.fetch_add(size, Ordering::Relaxed);

        // Coalesce with the predecessor, or thread a fresh block.
        if prev != 0 {
            let prev_size = unsafe { (*self.free_block(prev)).size };
            if prev + prev_size == start {
                unsafe {
                    let blk = &mut *self.free_block(prev);
                    blk.size += size;
                    blk.next = next;
                }
                if next == 0 {
                    state.free_tail.store(prev, Ordering::Relaxed);
                } else {
                    unsafe { (*self.free_block(next)).prev = prev };
                }
                return;
            }
        }

        unsafe {
            *self.free_block(start) = FreeBlock { prev, next, size };
        }
        if prev == 0 {
            state.free_head.store(start, Ordering::Relaxed);
        } else {
            unsafe { (*self.free_block(prev)).next = start };
        }
        if next == 0 {
            state.free_tail.store(start, Ordering::Relaxed);
        } else {
            unsafe { (*self.free_block(next)).prev = start };
        }
    }

    /// Grow the pool and append the new bytes as a free region. Prefers
    /// doubling; falls back to the minimal growth before reporting
    /// exhaustion.
    fn grow(&self, extent: u64) -> Result<()> {
        let pool_size = self.pool.size();
        let doubled = pool_size + pool_size.max(extent);
        match self.pool.expand(doubled) {
            Err(Error::LimitExceeded { .. }) => {
                self.pool.expand(pool_size + extent).map_err(|e| match e {
                    Error::LimitExceeded { .. } => Error::OutOfMemory { requested: extent },
                    other => other,
                })?
            }
            other => other?,
        }
        self.insert_free_region(pool_size, self.pool.size() - pool_size);
        Ok(())
    }

    /// Walk the free list and check the structural invariants: ascending,
    /// non-adjacent, in-bounds blocks with consistent back links, and a
    /// byte total matching the counter.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let pool_size = self.pool.size();
        let state = self.state();
        let mut off = state.free_head.load(Ordering::Relaxed);
        let mut prev = 0u64;
        let mut prev_end = 0u64;
        let mut total = 0u64;
        while off != 0 {
            let blk = unsafe { &*self.free_block(off) };
            if blk.prev != prev {
                return Err(format!("free block {off}: bad prev link"));
            }
            if blk.size < FREE_HEADER_SIZE {
                return Err(format!("free block {off}: undersized ({})", blk.size));
            }
            if off < ARENA_BASE || off + blk.size > pool_size {
                return Err(format!("free block {off}: out of bounds"));
            }
            if prev_end != 0 && off <= prev_end {
                return Err(format!("free block {off}: overlaps or abuts predecessor"));
            }
            total += blk.size;
            prev = off;
            prev_end = off + blk.size;
            off = blk.next;
        }
        if state.free_tail.load(Ordering::Relaxed) != prev {
            return Err("free tail does not match last block".to_string());
        }
        if total != state.bytes_free.load(Ordering::Relaxed) {
            return Err(format!(
                "free bytes mismatch: walked {total}, counter {}",
                state.bytes_free.load(Ordering::Relaxed)
            ));
        }
        Ok(())
    }
}

impl Allocator for SimpleAllocator {
    fn allocate(&self, size: u64) -> Result<u64> {
        let extent = block_extent(size);
        loop {
            let mut off = self.state().free_head.load(Ordering::Relaxed);
            while off != 0 {
                let (next, block_size) = unsafe {
                    let blk = &*self.free_block(off);
                    (blk.next, blk.size)
                };
                if block_size >= extent {
                    self.take_block(off, size, extent);
                    return Ok(off + ALLOC_HEADER_SIZE);
                }
                off = next;
            }
            self.grow(extent)?;
        }
    }

    fn free(&self, offset: u64) {
        if offset == 0 {
            return;
        }
        let block = offset - ALLOC_HEADER_SIZE;
        let (requested, slack) = unpack_header(unsafe { *self.pool.at::<u64>(block) });
        let extent = block_extent(requested) + slack;
        let state = self.state();
        state.bytes_allocated.fetch_sub(requested, Ordering::Relaxed);
        state.bytes_committed.fetch_sub(extent, Ordering::Relaxed);
        self.insert_free_region(block, extent);
    }

    fn block_size(&self, offset: u64) -> u64 {
        let (requested, slack) = unpack_header(unsafe {
            *self.pool.at::<u64>(offset - ALLOC_HEADER_SIZE)
        });
        block_extent(requested) + slack - ALLOC_HEADER_SIZE
    }

    fn set_base_object_offset(&self, offset: u64) {
        self.state()
            .base_object_offset
            .store(offset, Ordering::Release);
    }

    fn base_object_offset(&self) -> u64 {
        self.state().base_object_offset.load(Ordering::Acquire)
    }

    fn bytes_allocated(&self) -> u64 {
        self.state().bytes_allocated.load(Ordering::Relaxed)
    }

    fn bytes_free(&self) -> u64 {
        self.state().bytes_free.load(Ordering::Relaxed)
    }

    fn pool(&self) -> &Rc<Pool> {
        &self.pool
    }
}
