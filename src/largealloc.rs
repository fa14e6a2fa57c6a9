//! Power-of-two large blocks, one free stack per large class.
//!
//! A large class `c` holds blocks of `2^(SUPERSLAB_BITS + c)` bytes. The
//! engine is deliberately not thread-safe: every allocator owns one, and
//! superslabs/mediumslabs recycle through class 0 of their owner.

use std::cell::Cell;
use std::ptr;

use crate::config::{
    AllowReserve, DecommitStrategy, ZeroMem, DECOMMIT_STRATEGY, OS_PAGE_SIZE, SUPERSLAB_BITS,
};
use crate::provider::MemoryProvider;
use crate::sizeclass::NUM_LARGE_CLASSES;

/// Link written into the head of a freed large block while it sits on a
/// class stack; the block is dead to everyone else
#[repr(C)]
pub struct Largeslab {
    next: Cell<*mut Largeslab>,
}

pub struct LargeAlloc<M: MemoryProvider> {
    pub memory_provider: M,
    free_stacks: [Cell<*mut Largeslab>; NUM_LARGE_CLASSES],
}

impl<M: MemoryProvider> LargeAlloc<M> {
    pub fn new(memory_provider: M) -> Self {
        Self {
            memory_provider,
            free_stacks: std::array::from_fn(|_| Cell::new(ptr::null_mut())),
        }
    }

    /// Whether blocks of this class are guaranteed to have had their tail
    /// pages hinted back to the OS by the time they sit on the free stack.
    /// Must stay in sync with the hint the facade issues on the free side.
    pub fn tail_decommitted(large_class: usize) -> bool {
        DECOMMIT_STRATEGY == DecommitStrategy::All || large_class > 0
    }

    /// Pop a block of class `large_class`, or reserve fresh space rounded up
    /// to the class size. Returns null if the provider fails, or immediately
    /// when the stack is empty under [AllowReserve::NoReserve].
    pub fn alloc(
        &self,
        large_class: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> *mut u8 {
        debug_assert!(large_class < NUM_LARGE_CLASSES);
        let rsize = 1usize << (SUPERSLAB_BITS + large_class);

        let head = self.free_stacks[large_class].get();
        if head.is_null() {
            if allow_reserve == AllowReserve::NoReserve {
                return ptr::null_mut();
            }
            // Fresh reservations are zero on first touch, nothing more to do.
            return self.memory_provider.reserve(rsize, rsize);
        }

        unsafe {
            self.free_stacks[large_class].set((*head).next.get());
        }
        let p = head as *mut u8;

        if zero_mem == ZeroMem::YesZero {
            unsafe {
                // The first page holds the dead free-stack link and whatever
                // header the block carried in its previous life.
                ptr::write_bytes(p, 0, OS_PAGE_SIZE);
                if !Self::tail_decommitted(large_class) {
                    // Tail pages may still hold old contents; a discard hint
                    // is cheaper than storing 2^24+ zero bytes.
                    self.memory_provider
                        .notify_not_using(p.add(OS_PAGE_SIZE), rsize - OS_PAGE_SIZE);
                }
            }
        }
        p
    }

    /// Push a dead block back onto its class stack. Decommit hints are the
    /// caller's business; this only relinks.
    pub fn dealloc(&self, p: *mut u8, large_class: usize) {
        debug_assert!(large_class < NUM_LARGE_CLASSES);
        debug_assert_eq!(p as usize % (1 << SUPERSLAB_BITS), 0);
        let slab = p as *mut Largeslab;
        unsafe {
            (*slab).next.set(self.free_stacks[large_class].get());
        }
        self.free_stacks[large_class].set(slab);
    }
}
