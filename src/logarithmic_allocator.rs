//! Buddy allocator with power-of-two size classes
//!
//! Size class `k` holds blocks of exactly `2^k` bytes on a per-class
//! doubly-linked free list. Allocation pops the smallest sufficient class,
//! splitting larger blocks downward; freeing merges a block with its buddy
//! (the block whose arena-relative offset differs only in bit `k`) while
//! both are free and of the same class. Every block begins with a tag word
//! naming its class and free state, so a buddy can be inspected in place.
//!
//! Requests are rounded up to a power of two, so `bytes_allocated` (the sum
//! of requested sizes) diverges from actual consumption; the benchmark
//! reports the ratio as its efficiency figure.

use crate::allocator::{align8, Allocator, ALLOCATOR_STATE_OFFSET};
use crate::error::{Error, Result};
use crate::pool::Pool;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest block is `2^MIN_CLASS` = 32 bytes: a free-block header plus one
/// granule.
const MIN_CLASS: u32 = 5;
/// Largest representable class; far beyond any real pool.
const MAX_CLASS: u32 = 47;
const NUM_CLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

/// Allocated block header: tag word + requested size.
const ALLOC_HEADER_SIZE: u64 = 16;

const TAG_FREE: u64 = 0x100;
const TAG_CLASS_MASK: u64 = 0xff;

#[inline]
fn tag(class: u32, free: bool) -> u64 {
    class as u64 | if free { TAG_FREE } else { 0 }
}

/// Pool-resident allocator state. Part of the cross-process ABI.
#[repr(C)]
struct State {
    initialized: AtomicU64,
    base_object_offset: AtomicU64,
    /// Sum of requested sizes of live allocations.
    bytes_allocated: AtomicU64,
    /// Sum of `2^k` over free blocks.
    bytes_free: AtomicU64,
    /// First arena byte; fixed at initialization. Buddy arithmetic is
    /// relative to this offset.
    arena_start: AtomicU64,
    /// Pool offset up to which the arena has been carved into blocks. May
    /// trail the pool end by a sliver smaller than the minimum block.
    carve_end: AtomicU64,
    /// Free-list head per class, `MIN_CLASS` first; 0 = empty.
    heads: [AtomicU64; NUM_CLASSES],
}

const ARENA_ALIGN_BASE: u64 = ALLOCATOR_STATE_OFFSET + std::mem::size_of::<State>() as u64;

/// Smallest class whose blocks hold `need` bytes.
#[inline]
fn class_for(need: u64) -> u32 {
    let ceil = 64 - (need - 1).leading_zeros();
    ceil.max(MIN_CLASS)
}

/// Buddy allocator. See the module docs.
pub struct LogarithmicAllocator {
    pool: Rc<Pool>,
}

impl LogarithmicAllocator {
    /// Attach to (or initialize) the allocator state of `pool`.
    ///
    /// The first attacher fixes the arena start and carves the initial
    /// arena; later attachers see the published state. Attaching an
    /// allocator of a different variant to the same pool is undefined.
    pub fn attach(pool: Rc<Pool>) -> Result<Self> {
        let arena_start = align8(ARENA_ALIGN_BASE);
        if pool.size() < arena_start + (1 << MIN_CLASS) {
            pool.expand(arena_start + (1 << MIN_CLASS))?;
        }
        let alloc = Self { pool };
        if alloc.state().initialized.load(Ordering::Acquire) == 0 {
            let state = alloc.state();
            state.arena_start.store(arena_start, Ordering::Relaxed);
            state.carve_end.store(arena_start, Ordering::Relaxed);
            alloc.carve();
            alloc.state().initialized.store(1, Ordering::Release);
        }
        Ok(alloc)
    }

    fn state(&self) -> &State {
        // The reference must not be held across a pool expansion; callers
        // re-fetch after any operation that can remap.
        unsafe { &*self.pool.at::<State>(ALLOCATOR_STATE_OFFSET) }
    }

    #[inline]
    fn word(&self, offset: u64) -> *mut u64 {
        self.pool.at::<u64>(offset)
    }

    fn head_of(&self, class: u32) -> u64 {
        self.state().heads[(class - MIN_CLASS) as usize].load(Ordering::Relaxed)
    }

    fn set_head(&self, class: u32, offset: u64) {
        self.state().heads[(class - MIN_CLASS) as usize].store(offset, Ordering::Relaxed);
    }

    /// Push a block onto the head of its class list and tag it free.
    fn push_free(&self, offset: u64, class: u32) {
        let head = self.head_of(class);
        unsafe {
            *self.word(offset) = tag(class, true);
            *self.word(offset + 8) = 0; // prev
            *self.word(offset + 16) = head; // next
            if head != 0 {
                *self.word(head + 8) = offset;
            }
        }
        self.set_head(class, offset);
    }

    /// Unlink a block known to be on the class list.
    fn remove_free(&self, offset: u64, class: u32) {
        let (prev, next) = unsafe { (*self.word(offset + 8), *self.word(offset + 16)) };
        if prev == 0 {
            self.set_head(class, next);
        } else {
            unsafe { *self.word(prev + 16) = next };
        }
        if next != 0 {
            unsafe { *self.word(next + 8) = prev };
        }
    }

    /// Carve `[carve_end, pool_size)` into maximal naturally-aligned
    /// power-of-two blocks. Natural alignment (relative to the arena start)
    /// is what keeps the halving hierarchy sound, which in turn makes every
    /// buddy tag read land on a real block header.
    fn carve(&self) {
        let state = self.state();
        let arena_start = state.arena_start.load(Ordering::Relaxed);
        let end = self.pool.size();
        let mut cur = state.carve_end.load(Ordering::Relaxed);
        let mut carved = 0u64;

        while cur + (1 << MIN_CLASS) <= end {
            let rel = cur - arena_start;
            let align_class = if rel == 0 {
                MAX_CLASS
            } else {
                rel.trailing_zeros()
            };
            let size_class = 63 - (end - cur).leading_zeros();
            let class = align_class.min(size_class).min(MAX_CLASS);
            if class < MIN_CLASS {
                break;
            }
            self.push_free(cur, class);
            carved += 1 << class;
            cur += 1 << class;
        }

        let state = self.state();
        state.carve_end.store(cur, Ordering::Relaxed);
        state.bytes_free.fetch_add(carved, Ordering::Relaxed);
    }

    /// Pop a block of exactly `class`, splitting a larger block downward if
    /// needed. Returns the block offset (not the user offset).
    fn take_from_class(&self, class: u32) -> Option<u64> {
        let mut from = class;
        while from <= MAX_CLASS && self.head_of(from) == 0 {
            from += 1;
        }
        if from > MAX_CLASS {
            return None;
        }
        let offset = self.head_of(from);
        self.remove_free(offset, from);
        // Keep the low half at each split; the upper buddy goes back on its
        // class list.
        while from > class {
            from -= 1;
            self.push_free(offset + (1 << from), from);
        }
        Some(offset)
    }

    /// Grow the pool enough to carve at least one class-`class` block, or
    /// as far as the size limit allows.
    fn grow(&self, class: u32) -> Result<()> {
        let pool_size = self.pool.size();
        let want = pool_size + (1u64 << (class + 1));
        match self.pool.expand(want) {
            Ok(()) => {}
            Err(Error::LimitExceeded { .. }) => {
                // Carve whatever headroom remains before giving up.
                let page = rustix::param::page_size() as u64;
                let max_down = self.pool.max_size() & !(page - 1);
                if max_down <= pool_size {
                    return Err(Error::OutOfMemory {
                        requested: 1 << class,
                    });
                }
                self.pool.expand(max_down).map_err(|e| match e {
                    Error::LimitExceeded { .. } => Error::OutOfMemory {
                        requested: 1 << class,
                    },
                    other => other,
                })?;
            }
            Err(e) => return Err(e),
        }
        self.carve();
        Ok(())
    }

    /// Walk every free list and check the structural invariants: tags match
    /// the list, blocks are in the carved arena and naturally aligned, and
    /// the byte total matches the counter.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let state = self.state();
        let arena_start = state.arena_start.load(Ordering::Relaxed);
        let carve_end = state.carve_end.load(Ordering::Relaxed);
        let mut total = 0u64;
        for class in MIN_CLASS..=MAX_CLASS {
            let mut prev = 0u64;
            let mut offset = self.head_of(class);
            while offset != 0 {
                let (t, p, next) = unsafe {
                    (
                        *self.word(offset),
                        *self.word(offset + 8),
                        *self.word(offset + 16),
                    )
                };
                if t != tag(class, true) {
                    return Err(format!("block {offset}: tag {t:#x} not free class {class}"));
                }
                if p != prev {
                    return Err(format!("block {offset}: bad prev link"));
                }
                if offset < arena_start || offset + (1 << class) > carve_end {
                    return Err(format!("block {offset}: outside carved arena"));
                }
                if (offset - arena_start) % (1 << class) != 0 {
                    return Err(format!("block {offset}: misaligned for class {class}"));
                }
                total += 1 << class;
                prev = offset;
                offset = next;
            }
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

impl Allocator for LogarithmicAllocator {
    fn allocate(&self, size: u64) -> Result<u64> {
        let class = class_for(size + ALLOC_HEADER_SIZE);
        if class > MAX_CLASS {
            return Err(Error::OutOfMemory { requested: size });
        }
        loop {
            if let Some(offset) = self.take_from_class(class) {
                unsafe {
                    *self.word(offset) = tag(class, false);
                    *self.word(offset + 8) = size;
                }
                let state = self.state();
                state.bytes_allocated.fetch_add(size, Ordering::Relaxed);
                state.bytes_free.fetch_sub(1 << class, Ordering::Relaxed);
                return Ok(offset + ALLOC_HEADER_SIZE);
            }
            self.grow(class)?;
        }
    }

    fn free(&self, offset: u64) {
        if offset == 0 {
            return;
        }
        let mut block = offset - ALLOC_HEADER_SIZE;
        let (t, requested) = unsafe { (*self.word(block), *self.word(block + 8)) };
        let mut class = (t & TAG_CLASS_MASK) as u32;

        let state = self.state();
        state.bytes_allocated.fetch_sub(requested, Ordering::Relaxed);
        state.bytes_free.fetch_add(1 << class, Ordering::Relaxed);
        let arena_start = state.arena_start.load(Ordering::Relaxed);
        let carve_end = state.carve_end.load(Ordering::Relaxed);

        // Merge with the buddy while it is a free block of the same class.
        while class < MAX_CLASS {
            let buddy = arena_start + ((block - arena_start) ^ (1 << class));
            if buddy + (1 << class) > carve_end {
                break;
            }
            let buddy_tag = unsafe { *self.word(buddy) };
            if buddy_tag != tag(class, true) {
                break;
            }
            self.remove_free(buddy, class);
            block = block.min(buddy);
            class += 1;
        }
        self.push_free(block, class);
    }

    fn block_size(&self, offset: u64) -> u64 {
        let t = unsafe { *self.word(offset - ALLOC_HEADER_SIZE) };
        (1 << (t & TAG_CLASS_MASK)) - ALLOC_HEADER_SIZE
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
