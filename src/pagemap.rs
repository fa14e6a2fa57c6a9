//! Global pagemap: one byte of classification per superslab-aligned region.
//!
//! Entry encoding:
//! * `0` — address not managed by any allocator in this process
//! * [PM_SUPERSLAB] — a superslab of small-object slabs starts here
//! * [PM_MEDIUMSLAB] — a mediumslab starts here
//! * `k` in `[SUPERSLAB_BITS, 63]` — head of a large allocation of `2^k` bytes
//! * `64 + j` — redirect: the head of the containing large allocation lies
//!   `2^(j - SUPERSLAB_BITS)` superslabs earlier
//!
//! Each entry has a single writer (the allocator owning that superslab), so
//! writes to one entry never race; readers on other threads observe entries
//! only for pointers that were handed to them, after the entry was written.
//!
//! The stores use `std::sync::atomic` directly rather than the loom shim:
//! the map is a process global and is not part of any loom model.

use std::alloc;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::config::{ADDRESS_BITS, SUPERSLAB_BITS, SUPERSLAB_SIZE};
use crate::util::{next_pow2, next_pow2_bits};

pub const PM_NOT_OURS: u8 = 0;
pub const PM_SUPERSLAB: u8 = 1;
pub const PM_MEDIUMSLAB: u8 = 2;
/// Tags at or above this value are redirects into a large allocation
pub const PM_LARGE_REDIRECT_BASE: u8 = 64;

const ENTRY_COUNT: usize = 1 << (ADDRESS_BITS - SUPERSLAB_BITS);

// Large-head tags must not collide with the slab tags.
const _: () = assert!(SUPERSLAB_BITS > PM_MEDIUMSLAB as usize);

/// Contract shared by the flat and sparse stores
pub trait PagemapStore {
    /// Read the entry for `addr` (rounded down to a superslab boundary).
    /// Unknown or out-of-range addresses read as [PM_NOT_OURS].
    fn get(&self, addr: usize) -> u8;
    /// Write the entry for `addr` (rounded down to a superslab boundary)
    fn set(&self, addr: usize, x: u8);
    /// Write `count` consecutive entries starting at `addr`
    fn set_range(&self, addr: usize, x: u8, count: usize) {
        for i in 0..count {
            self.set(addr + i * SUPERSLAB_SIZE, x);
        }
    }
}

/// Flat store: one contiguous byte array covering the whole address space,
/// allocated (zeroed) on first write
pub struct FlatPagemap {
    base: AtomicPtr<u8>,
}

const FLAT_LAYOUT: alloc::Layout = match alloc::Layout::from_size_align(ENTRY_COUNT, 64) {
    Ok(x) => x,
    Err(_) => panic!("Invalid pagemap layout"),
};

impl FlatPagemap {
    pub const fn new() -> Self {
        Self {
            base: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn base_or_init(&self) -> *mut u8 {
        // order: acquire pairs with the release of whichever thread installed
        // the array, so entries read through it are at least zero-initialized
        let base = self.base.load(Ordering::Acquire);
        if !base.is_null() {
            return base;
        }
        let fresh = unsafe { alloc::alloc_zeroed(FLAT_LAYOUT) };
        if fresh.is_null() {
            alloc::handle_alloc_error(FLAT_LAYOUT);
        }
        match self.base.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(existing) => {
                // lost the race, another thread's array is the real one
                unsafe { alloc::dealloc(fresh, FLAT_LAYOUT) };
                existing
            }
        }
    }

    fn entry(base: *mut u8, index: usize) -> &'static AtomicU8 {
        // safety: index is bounds-checked by the callers; the array is never
        // freed once installed
        unsafe { &*(base.add(index) as *const AtomicU8) }
    }
}

impl PagemapStore for FlatPagemap {
    fn get(&self, addr: usize) -> u8 {
        let index = addr >> SUPERSLAB_BITS;
        if index >= ENTRY_COUNT {
            return PM_NOT_OURS;
        }
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return PM_NOT_OURS;
        }
        Self::entry(base, index).load(Ordering::Acquire)
    }

    fn set(&self, addr: usize, x: u8) {
        let index = addr >> SUPERSLAB_BITS;
        assert!(index < ENTRY_COUNT, "address beyond pagemap coverage");
        let base = self.base_or_init();
        // order: release so a reader that learned of this region through a
        // pointer handoff sees the classification written before the handoff
        Self::entry(base, index).store(x, Ordering::Release);
    }
}

/// Sparse store: a root table of lazily-populated leaf arrays, for address
/// spaces where the flat array would be too large to reserve up front
pub struct SparsePagemap {
    root: [AtomicPtr<u8>; 1 << ROOT_BITS],
}

const LEAF_BITS: usize = 12;
const ROOT_BITS: usize = (ADDRESS_BITS - SUPERSLAB_BITS) - LEAF_BITS;
const LEAF_ENTRIES: usize = 1 << LEAF_BITS;

const LEAF_LAYOUT: alloc::Layout = match alloc::Layout::from_size_align(LEAF_ENTRIES, 64) {
    Ok(x) => x,
    Err(_) => panic!("Invalid pagemap leaf layout"),
};

impl SparsePagemap {
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; 1 << ROOT_BITS],
        }
    }

    fn leaf_or_init(&self, top: usize) -> *mut u8 {
        let leaf = self.root[top].load(Ordering::Acquire);
        if !leaf.is_null() {
            return leaf;
        }
        let fresh = unsafe { alloc::alloc_zeroed(LEAF_LAYOUT) };
        if fresh.is_null() {
            alloc::handle_alloc_error(LEAF_LAYOUT);
        }
        match self.root[top].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(existing) => {
                unsafe { alloc::dealloc(fresh, LEAF_LAYOUT) };
                existing
            }
        }
    }
}

impl PagemapStore for SparsePagemap {
    fn get(&self, addr: usize) -> u8 {
        let index = addr >> SUPERSLAB_BITS;
        if index >= ENTRY_COUNT {
            return PM_NOT_OURS;
        }
        let leaf = self.root[index >> LEAF_BITS].load(Ordering::Acquire);
        if leaf.is_null() {
            return PM_NOT_OURS;
        }
        let entry = unsafe { &*(leaf.add(index & (LEAF_ENTRIES - 1)) as *const AtomicU8) };
        entry.load(Ordering::Acquire)
    }

    fn set(&self, addr: usize, x: u8) {
        let index = addr >> SUPERSLAB_BITS;
        assert!(index < ENTRY_COUNT, "address beyond pagemap coverage");
        let leaf = self.leaf_or_init(index >> LEAF_BITS);
        let entry = unsafe { &*(leaf.add(index & (LEAF_ENTRIES - 1)) as *const AtomicU8) };
        entry.store(x, Ordering::Release);
    }
}

#[cfg(feature = "sparse-pagemap")]
pub type SuperslabPagemap = SparsePagemap;
#[cfg(not(feature = "sparse-pagemap"))]
pub type SuperslabPagemap = FlatPagemap;

static GLOBAL_PAGEMAP: SuperslabPagemap = SuperslabPagemap::new();

pub fn global_pagemap() -> &'static SuperslabPagemap {
    &GLOBAL_PAGEMAP
}

/// Interface the allocator uses to classify regions. Injected as a type
/// parameter so the slab engines can be exercised against a stub map.
pub trait PageMap {
    fn get(&self, addr: usize) -> u8;
    fn set_superslab(&self, addr: usize);
    fn clear_superslab(&self, addr: usize);
    fn set_mediumslab(&self, addr: usize);
    fn clear_mediumslab(&self, addr: usize);
    fn set_large_size(&self, addr: usize, size: usize);
    fn clear_large_size(&self, addr: usize, size: usize);
}

/// Default [PageMap] adaptor, backed by the process-global store
#[derive(Clone, Copy, Default)]
pub struct SuperslabMap;

impl SuperslabMap {
    fn store(&self) -> &'static SuperslabPagemap {
        global_pagemap()
    }
}

impl PageMap for SuperslabMap {
    fn get(&self, addr: usize) -> u8 {
        self.store().get(addr)
    }

    fn set_superslab(&self, addr: usize) {
        self.store().set(addr, PM_SUPERSLAB);
    }

    fn clear_superslab(&self, addr: usize) {
        debug_assert_eq!(self.get(addr), PM_SUPERSLAB);
        self.store().set(addr, PM_NOT_OURS);
    }

    fn set_mediumslab(&self, addr: usize) {
        self.store().set(addr, PM_MEDIUMSLAB);
    }

    fn clear_mediumslab(&self, addr: usize) {
        debug_assert_eq!(self.get(addr), PM_MEDIUMSLAB);
        self.store().set(addr, PM_NOT_OURS);
    }

    fn set_large_size(&self, addr: usize, size: usize) {
        let store = self.store();
        let size_bits = next_pow2_bits(size);
        store.set(addr, size_bits as u8);
        // Redirect slide: runs of doubling length, each entry recording how
        // far back (log2, in bytes) the head lies.
        let mut ss = addr + SUPERSLAB_SIZE;
        for i in 0..(size_bits - SUPERSLAB_BITS) {
            let run = 1usize << i;
            store.set_range(
                ss,
                (PM_LARGE_REDIRECT_BASE as usize + i + SUPERSLAB_BITS) as u8,
                run,
            );
            ss += SUPERSLAB_SIZE * run;
        }
    }

    fn clear_large_size(&self, addr: usize, size: usize) {
        let count = next_pow2(size) >> SUPERSLAB_BITS;
        debug_assert_eq!(self.get(addr) as usize, next_pow2_bits(size));
        self.store().set_range(addr, PM_NOT_OURS, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test addresses sit far from anything real allocations could occupy.
    const T: usize = 0x5000_0000_0000;

    fn store_contract(store: &impl PagemapStore, base: usize) {
        assert_eq!(store.get(base), PM_NOT_OURS);
        store.set(base, PM_SUPERSLAB);
        assert_eq!(store.get(base), PM_SUPERSLAB);
        // interior addresses round down to the same entry
        assert_eq!(store.get(base + SUPERSLAB_SIZE / 2), PM_SUPERSLAB);
        // neighbours untouched
        assert_eq!(store.get(base + SUPERSLAB_SIZE), PM_NOT_OURS);
        assert_eq!(store.get(base - SUPERSLAB_SIZE), PM_NOT_OURS);

        store.set_range(base + SUPERSLAB_SIZE, PM_MEDIUMSLAB, 3);
        for i in 1..=3 {
            assert_eq!(store.get(base + i * SUPERSLAB_SIZE), PM_MEDIUMSLAB);
        }
        assert_eq!(store.get(base + 4 * SUPERSLAB_SIZE), PM_NOT_OURS);

        store.set(base, PM_NOT_OURS);
        store.set_range(base + SUPERSLAB_SIZE, PM_NOT_OURS, 3);
    }

    #[test]
    fn flat_store_contract() {
        let map = FlatPagemap::new();
        store_contract(&map, T);
    }

    #[test]
    fn sparse_store_contract() {
        let map = SparsePagemap::new();
        store_contract(&map, T);
        // exercise a second leaf
        store_contract(&map, T + (LEAF_ENTRIES + 7) * SUPERSLAB_SIZE);
    }

    #[test]
    fn out_of_range_reads_as_not_ours() {
        let map = FlatPagemap::new();
        assert_eq!(map.get(usize::MAX), PM_NOT_OURS);
    }

    #[test]
    fn large_slide_encoding() {
        let map = SuperslabMap;
        let base = T + (1 << 30); // keep clear of the other tests' entries
        let size = 4 * SUPERSLAB_SIZE; // 2^26

        map.set_large_size(base, size);
        assert_eq!(map.get(base) as usize, SUPERSLAB_BITS + 2);
        // slot 1: one-superslab step back
        assert_eq!(
            map.get(base + SUPERSLAB_SIZE) as usize,
            PM_LARGE_REDIRECT_BASE as usize + SUPERSLAB_BITS
        );
        // slots 2-3: two-superslab steps back
        for i in 2..4 {
            assert_eq!(
                map.get(base + i * SUPERSLAB_SIZE) as usize,
                PM_LARGE_REDIRECT_BASE as usize + SUPERSLAB_BITS + 1
            );
        }

        // walking the slide from any slot reaches the head
        for i in 1..4 {
            let mut ss = base + i * SUPERSLAB_SIZE;
            let mut steps = 0;
            let mut tag = map.get(ss);
            while tag > PM_LARGE_REDIRECT_BASE {
                ss -= 1usize << (tag - PM_LARGE_REDIRECT_BASE) as usize;
                tag = map.get(ss);
                steps += 1;
                assert!(steps <= 2);
            }
            assert_eq!(ss, base);
        }

        map.clear_large_size(base, size);
        for i in 0..4 {
            assert_eq!(map.get(base + i * SUPERSLAB_SIZE), PM_NOT_OURS);
        }
    }
}
