//! Mediumslabs: a whole superslab-sized region carved into page-aligned
//! cells of one medium size class.
//!
//! The header keeps a stack of free cell indices. Cells are laid downward
//! from the region end above a one-page header ceiling, so every cell
//! boundary is at a multiple of the class size from the region end.

use std::cell::Cell;
use std::mem::{offset_of, size_of};

use crate::config::{OS_PAGE_SIZE, SLAB_COUNT, SUPERSLAB_SIZE, ZeroMem};
use crate::list::{DllLink, DllNode};
use crate::remote::RemoteAllocator;

/// Space reserved for the header; medium cell areas start above this
pub const MEDIUM_HEADER_CEILING: usize = OS_PAGE_SIZE;

/// Upper bound on cells of any medium class (smallest class is slab-sized)
const MAX_MEDIUM_CELLS: usize = SLAB_COUNT;

#[repr(C)]
pub struct Mediumslab {
    /// Owner's mailbox; same first-word contract as the superslab header
    allocator: Cell<*const RemoteAllocator>,
    link: DllLink<Mediumslab>,
    sizeclass: Cell<u8>,
    /// Stack pointer into `stack`; entries at or above it are free indices
    head: Cell<u16>,
    cell_count: Cell<u16>,
    free: Cell<u16>,
    stack: [Cell<u16>; MAX_MEDIUM_CELLS],
}

impl DllNode for Mediumslab {
    fn link(&self) -> &DllLink<Self> {
        &self.link
    }
}

const _: () = assert!(offset_of!(Mediumslab, allocator) == 0);
const _: () = assert!(size_of::<Mediumslab>() <= MEDIUM_HEADER_CEILING);

/// Cells a mediumslab of this class holds
pub const fn medium_cell_count(rsize: usize) -> usize {
    (SUPERSLAB_SIZE - MEDIUM_HEADER_CEILING) / rsize
}

impl Mediumslab {
    /// Recover the containing mediumslab by address masking
    #[inline]
    pub fn get(p: *const u8) -> *mut Mediumslab {
        ((p as usize) & !(SUPERSLAB_SIZE - 1)) as *mut Mediumslab
    }

    #[inline]
    pub unsafe fn get_allocator(this: *const Mediumslab) -> *const RemoteAllocator {
        (*this).allocator.get()
    }

    pub unsafe fn get_sizeclass(this: *const Mediumslab) -> u8 {
        (*this).sizeclass.get()
    }

    pub unsafe fn init(
        this: *mut Mediumslab,
        allocator: *const RemoteAllocator,
        sizeclass: u8,
        rsize: usize,
    ) {
        let cells = medium_cell_count(rsize) as u16;
        (*this).allocator.set(allocator);
        (*this).sizeclass.set(sizeclass);
        (*this).head.set(0);
        (*this).cell_count.set(cells);
        (*this).free.set(cells);
        for i in 0..cells {
            (*this).stack[i as usize].set(i);
        }
    }

    pub unsafe fn full(this: *const Mediumslab) -> bool {
        (*this).free.get() == 0
    }

    pub unsafe fn empty(this: *const Mediumslab) -> bool {
        (*this).free.get() == (*this).cell_count.get()
    }

    /// Take a cell; `size` is the caller-requested byte count to zero
    pub unsafe fn alloc(
        this: *mut Mediumslab,
        rsize: usize,
        size: usize,
        zero_mem: ZeroMem,
    ) -> *mut u8 {
        debug_assert!(!Self::full(this));
        let head = (*this).head.get();
        let index = (*this).stack[head as usize].get();
        (*this).head.set(head + 1);
        (*this).free.set((*this).free.get() - 1);

        let p = Self::cell_address(this, index, rsize);
        if zero_mem == ZeroMem::YesZero {
            std::ptr::write_bytes(p, 0, size);
        }
        p
    }

    /// Mark `p` free; reports whether the slab was full beforehand
    pub unsafe fn dealloc(this: *mut Mediumslab, p: *const u8, rsize: usize) -> bool {
        let was_full = Self::full(this);
        let index = Self::cell_index(this, p, rsize);
        let head = (*this).head.get() - 1;
        (*this).stack[head as usize].set(index);
        (*this).head.set(head);
        (*this).free.set((*this).free.get() + 1);
        was_full
    }

    fn cell_address(this: *const Mediumslab, index: u16, rsize: usize) -> *mut u8 {
        (this as usize + SUPERSLAB_SIZE - (index as usize + 1) * rsize) as *mut u8
    }

    fn cell_index(this: *const Mediumslab, p: *const u8, rsize: usize) -> u16 {
        let offset_from_end = this as usize + SUPERSLAB_SIZE - p as usize;
        (offset_from_end / rsize - 1) as u16
    }
}
