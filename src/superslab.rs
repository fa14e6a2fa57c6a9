//! Superslabs: superslab-aligned regions carved into equal slabs, each slab
//! holding cells of a single small size class.
//!
//! The header (owner pointer, occupancy, per-slab [Metaslab] table) lives at
//! the start of the region and shares the first slab's space; that "short"
//! slab therefore hosts fewer cells and only classes passing
//! [is_short_sizeclass] may use it. Cells are aligned to the *end* of their
//! slab, so every cell boundary sits at a multiple of the class size from
//! the slab end; interior-pointer recovery and the misaligned-free checks
//! rely on this.

use std::cell::Cell;
use std::mem::{offset_of, size_of};

use crate::config::{OS_PAGE_SIZE, SLAB_BITS, SLAB_COUNT, SLAB_SIZE, SUPERSLAB_SIZE};
use crate::list::{DlList, DllLink, DllNode};
use crate::provider::MemoryProvider;
use crate::remote::RemoteAllocator;
use crate::sizeclass::{size_to_sizeclass_const, sizeclass_to_size};
use crate::util::roundto;

/// Link threaded through the dead cells of a slab's free chain
#[repr(C)]
pub struct FreeCell {
    next: Cell<*mut FreeCell>,
}

/// Sentinel index for the free-slab stack
const NO_SLAB: u16 = u16::MAX;

/// Per-slab bookkeeping, stored in the superslab header table
#[repr(C)]
pub struct Metaslab {
    /// Head of the free-cell chain; null means the slab is fully allocated
    free: Cell<*mut FreeCell>,
    /// Cells currently handed out
    used: Cell<u16>,
    /// Link in the superslab's free-slab stack while the slab is not carved
    next_free: Cell<u16>,
    /// Class the slab is carved for; stale while the slab is free
    sizeclass: Cell<u8>,
    /// Membership in the owning allocator's class list while carved
    link: DllLink<Metaslab>,
}

impl DllNode for Metaslab {
    fn link(&self) -> &DllLink<Self> {
        &self.link
    }
}

/// What a cell-level dealloc did to the containing superslab
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// The slab still holds live cells
    NoSlabReturn,
    /// The slab returned to the superslab; superslab status unchanged
    NoStatusChange,
    /// The slab returned and the superslab changed status
    StatusChange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Full,
    Available,
    OnlyShortSlabAvailable,
    Empty,
}

/// Header of a superslab. Never constructed by value: it is a view imposed
/// on the first bytes of the region, manipulated through raw pointers.
#[repr(C)]
pub struct Superslab {
    /// Mailbox of the owning allocator; read by foreign threads when they
    /// post freed objects back. Written only during init, which happens
    /// before any object from this region can escape.
    allocator: Cell<*const RemoteAllocator>,
    /// Occupancy: the short slab counts 1, every full slab counts 2
    used: Cell<u32>,
    /// Head of the free-slab index stack, threaded through `next_free`
    head: Cell<u16>,
    /// Membership in `super_available` / `super_only_short_available`
    link: DllLink<Superslab>,
    meta: [Metaslab; SLAB_COUNT],
}

impl DllNode for Superslab {
    fn link(&self) -> &DllLink<Self> {
        &self.link
    }
}

// The owner pointer must be the first word: the remote-posting path reads
// it through a bare superslab-aligned address, for mediumslabs too.
const _: () = assert!(offset_of!(Superslab, allocator) == 0);
const _: () = assert!(size_of::<Superslab>() < SLAB_SIZE);

/// Largest class allowed to carve the short slab
const SHORT_SIZECLASS_CEILING: u8 = size_to_sizeclass_const(SLAB_SIZE >> 4);

pub fn is_short_sizeclass(sizeclass: u8) -> bool {
    sizeclass <= SHORT_SIZECLASS_CEILING
}

/// Cells a slab of this class holds; the short slab loses the header span
pub const fn slab_cell_count(is_short: bool, rsize: usize) -> usize {
    let space = if is_short {
        SLAB_SIZE - size_of::<Superslab>()
    } else {
        SLAB_SIZE
    };
    space / rsize
}

impl Superslab {
    /// Recover the containing superslab by address masking
    #[inline]
    pub fn get(p: *const u8) -> *mut Superslab {
        ((p as usize) & !(SUPERSLAB_SIZE - 1)) as *mut Superslab
    }

    /// Read the owner through a bare region pointer
    #[inline]
    pub unsafe fn get_allocator(this: *const Superslab) -> *const RemoteAllocator {
        (*this).allocator.get()
    }

    /// Stamp a fresh (or recycled) region as a superslab owned by
    /// `allocator`. The region may have been decommitted past its first
    /// page by a previous life, so the header span is recommitted first.
    pub unsafe fn init(
        this: *mut Superslab,
        allocator: *const RemoteAllocator,
        provider: &impl MemoryProvider,
    ) {
        let header = roundto(size_of::<Superslab>(), OS_PAGE_SIZE);
        if header > OS_PAGE_SIZE {
            provider.notify_using(
                (this as *mut u8).add(OS_PAGE_SIZE),
                header - OS_PAGE_SIZE,
            );
        }

        (*this).allocator.set(allocator);
        (*this).used.set(0);
        (*this).head.set(1);
        for i in 0..SLAB_COUNT {
            let meta = &(*this).meta[i];
            meta.free.set(std::ptr::null_mut());
            meta.used.set(0);
            meta.sizeclass.set(0);
            meta.next_free
                .set(if i + 1 < SLAB_COUNT { (i + 1) as u16 } else { NO_SLAB });
        }
    }

    pub unsafe fn get_meta<'a>(this: *mut Superslab, p: *const u8) -> &'a Metaslab {
        let index = ((p as usize) & (SUPERSLAB_SIZE - 1)) >> SLAB_BITS;
        &(*this).meta[index]
    }

    pub unsafe fn get_status(this: *const Superslab) -> Status {
        let used = (*this).used.get();
        if used == 0 {
            Status::Empty
        } else if (*this).head.get() != NO_SLAB {
            Status::Available
        } else if used & 1 == 0 {
            Status::OnlyShortSlabAvailable
        } else {
            Status::Full
        }
    }

    pub unsafe fn is_full(this: *const Superslab) -> bool {
        Self::get_status(this) == Status::Full
    }

    /// Carve the short slab for `sizeclass`; falls through to a regular
    /// slab when the short one is already out
    pub unsafe fn alloc_short_slab(this: *mut Superslab, sizeclass: u8) -> *mut Metaslab {
        if (*this).used.get() & 1 == 1 {
            return Self::alloc_slab(this, sizeclass);
        }
        (*this).used.set((*this).used.get() + 1);
        let meta = &(*this).meta[0];
        meta.carve(sizeclass);
        meta as *const Metaslab as *mut Metaslab
    }

    /// Carve a regular slab for `sizeclass`. The caller must have checked
    /// the superslab has one (status Available).
    pub unsafe fn alloc_slab(this: *mut Superslab, sizeclass: u8) -> *mut Metaslab {
        let index = (*this).head.get();
        debug_assert!(index != NO_SLAB);
        let meta = &(*this).meta[index as usize];
        (*this).head.set(meta.next_free.get());
        (*this).used.set((*this).used.get() + 2);
        meta.carve(sizeclass);
        meta as *const Metaslab as *mut Metaslab
    }

    /// Return a fully-freed slab to the superslab; reports whether the
    /// superslab's status changed
    unsafe fn dealloc_slab(this: *mut Superslab, index: usize) -> Action {
        let before = Self::get_status(this);
        if index == 0 {
            (*this).used.set((*this).used.get() - 1);
        } else {
            let meta = &(*this).meta[index];
            meta.next_free.set((*this).head.get());
            (*this).head.set(index as u16);
            (*this).used.set((*this).used.get() - 2);
        }
        if Self::get_status(this) == before {
            Action::NoStatusChange
        } else {
            Action::StatusChange
        }
    }
}

impl Metaslab {
    pub fn superslab(&self) -> *mut Superslab {
        Superslab::get(self as *const Metaslab as *const u8)
    }

    pub fn index(&self) -> usize {
        let table = self.superslab() as usize + offset_of!(Superslab, meta);
        (self as *const Metaslab as usize - table) / size_of::<Metaslab>()
    }

    pub fn slab_base(&self) -> *mut u8 {
        (self.superslab() as usize + (self.index() << SLAB_BITS)) as *mut u8
    }

    pub fn sizeclass(&self) -> u8 {
        self.sizeclass.get()
    }

    pub fn is_full(&self) -> bool {
        self.free.get().is_null()
    }

    /// Address of the first (lowest) cell; cells run from here to the slab
    /// end in `rsize` steps
    pub fn first_cell(&self) -> usize {
        let rsize = sizeclass_to_size(self.sizeclass.get());
        let cells = slab_cell_count(self.index() == 0, rsize);
        self.slab_base() as usize + SLAB_SIZE - cells * rsize
    }

    /// Set up the slab for a class and chain every cell onto the free list
    fn carve(&self, sizeclass: u8) {
        self.sizeclass.set(sizeclass);
        self.used.set(0);

        let rsize = sizeclass_to_size(sizeclass);
        let cells = slab_cell_count(self.index() == 0, rsize);
        debug_assert!(cells > 0);
        let first = self.slab_base() as usize + SLAB_SIZE - cells * rsize;
        unsafe {
            for i in 0..cells {
                let cell = (first + i * rsize) as *mut FreeCell;
                let next = if i + 1 < cells {
                    (first + (i + 1) * rsize) as *mut FreeCell
                } else {
                    std::ptr::null_mut()
                };
                (*cell).next.set(next);
            }
        }
        self.free.set(first as *mut FreeCell);
    }

    /// Pop one cell. The caller zeroes it if asked to.
    pub unsafe fn alloc_cell(&self) -> *mut u8 {
        let cell = self.free.get();
        debug_assert!(!cell.is_null());
        self.free.set((*cell).next.get());
        self.used.set(self.used.get() + 1);
        cell as *mut u8
    }
}

/// Mark `p` free in its slab. Handles the slab's membership in its class
/// list: a full slab rejoins the list, an emptied slab leaves it and goes
/// back to the superslab.
pub unsafe fn slab_dealloc(
    this: *mut Superslab,
    sc: &DlList<Metaslab>,
    p: *mut u8,
) -> Action {
    let meta = Superslab::get_meta(this, p);
    let was_full = meta.is_full();

    let cell = p as *mut FreeCell;
    (*cell).next.set(meta.free.get());
    meta.free.set(cell);
    let used = meta.used.get() - 1;
    meta.used.set(used);

    if used == 0 {
        // A full slab is not on the class list, so only unlink otherwise.
        if !was_full {
            sc.remove(meta as *const Metaslab as *mut Metaslab);
        }
        return Superslab::dealloc_slab(this, meta.index());
    }
    if was_full {
        sc.insert(meta as *const Metaslab as *mut Metaslab);
    }
    Action::NoSlabReturn
}
