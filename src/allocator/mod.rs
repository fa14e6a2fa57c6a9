//! The per-thread allocator facade.
//!
//! One `Allocator` serves one thread (or one logical owner). All of its
//! internal state — class lists, superslab lists, the outgoing remote cache
//! — is strictly single-threaded. The only cross-thread coupling is the
//! mailbox: freeing an object owned by another allocator stamps the dead
//! object with a routing header and posts it back, and every public entry
//! point drains this allocator's own mailbox first.
//!
//! The design follows the shard-per-thread slab allocator family: local
//! free lists with no locks on any path, and message passing instead of
//! shared free lists for the cross-thread case.

use std::ptr;

use tracing::Level;

use crate::config::{
    AllowReserve, DecommitStrategy, ZeroMem, DECOMMIT_STRATEGY, OS_PAGE_SIZE, REMOTE_BATCH,
    REMOTE_CACHE, SAFE_CLIENT, SLAB_SIZE, SUPERSLAB_SIZE,
};
use crate::largealloc::LargeAlloc;
use crate::list::DlList;
use crate::mediumslab::Mediumslab;
use crate::pagemap::{
    PageMap, SuperslabMap, PM_LARGE_REDIRECT_BASE, PM_MEDIUMSLAB, PM_NOT_OURS, PM_SUPERSLAB,
};
use crate::provider::{MemoryProvider, VirtualProvider};
use crate::remote::{AllocId, Remote, RemoteAllocator, RemoteCache};
use crate::sizeclass::{
    is_multiple_of_sizeclass, round_by_sizeclass, size_to_sizeclass, size_to_sizeclass_const,
    sizeclass_to_size, NUM_MEDIUM_CLASSES, NUM_SIZECLASSES, NUM_SMALL_CLASSES,
};
use crate::superslab::{
    is_short_sizeclass, slab_dealloc, Action, Metaslab, Status, Superslab,
};
use crate::util::{next_pow2_bits, UsizePtr};

/// Which end of an allocation `external_pointer` reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
}

/// Invalid-free and broken-invariant exits. Nothing in the allocator is
/// recoverable past this point.
#[cold]
fn fatal(msg: &str) -> ! {
    panic!("{}", msg);
}

pub struct Allocator<M: MemoryProvider = VirtualProvider, P: PageMap = SuperslabMap> {
    large_allocator: LargeAlloc<M>,
    page_map: P,

    small_classes: [DlList<Metaslab>; NUM_SMALL_CLASSES],
    medium_classes: [DlList<Mediumslab>; NUM_MEDIUM_CLASSES],

    /// Superslabs with at least one regular slab free
    super_available: DlList<Superslab>,
    /// Superslabs where only the short slab remains
    super_only_short_available: DlList<Superslab>,

    /// Outgoing batches of objects freed here on other allocators' behalf
    remote: RemoteCache,
    /// This allocator's identity and mailbox. Leaked to the heap so that
    /// superslab headers may hold bare pointers to it for the life of the
    /// process, wherever the `Allocator` value itself moves.
    remote_alloc: &'static RemoteAllocator,
}

// safety: every raw pointer inside points at memory this allocator owns
// (superslabs, mediumslabs, large blocks) or at the leaked mailbox; none of
// it is tied to the spawning thread. Not Sync: the single-owner discipline
// is the whole point.
unsafe impl<M: MemoryProvider + Send, P: PageMap + Send> Send for Allocator<M, P> {}

impl Allocator<VirtualProvider, SuperslabMap> {
    /// Allocator with the default provider and the global pagemap
    pub fn with_id(id: AllocId) -> Self {
        Self::new(id, VirtualProvider, SuperslabMap)
    }
}

impl<M: MemoryProvider, P: PageMap> Allocator<M, P> {
    pub fn new(id: AllocId, memory_provider: M, page_map: P) -> Self {
        #[cfg(debug_assertions)]
        {
            // The table must agree with itself before anything trusts it.
            for i in 0..NUM_SIZECLASSES as u8 {
                let size = sizeclass_to_size(i);
                assert_eq!(size_to_sizeclass(size), i);
                assert_eq!(size_to_sizeclass_const(size), i);
                if i as usize >= NUM_SMALL_CLASSES {
                    assert_eq!(size % OS_PAGE_SIZE, 0);
                }
            }
        }

        Self {
            large_allocator: LargeAlloc::new(memory_provider),
            page_map,
            small_classes: std::array::from_fn(|_| DlList::new()),
            medium_classes: std::array::from_fn(|_| DlList::new()),
            super_available: DlList::new(),
            super_only_short_available: DlList::new(),
            remote: RemoteCache::new(),
            remote_alloc: Box::leak(RemoteAllocator::new(id)),
        }
    }

    pub fn id(&self) -> AllocId {
        self.remote_alloc.id()
    }

    /// The shareable face of this allocator: stable id plus mailbox
    pub fn public_state(&self) -> &'static RemoteAllocator {
        self.remote_alloc
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes. `size` must be nonzero.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        self.alloc_opts(size, ZeroMem::NoZero, AllowReserve::YesReserve)
    }

    pub fn alloc_opts(
        &self,
        size: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> *mut u8 {
        debug_assert!(size != 0, "size must not be zero");
        let trace_span = tracing::span!(Level::TRACE, "allocator::alloc", id = self.id(), size);
        let _span_enter = trace_span.enter();

        self.handle_message_queue();

        let sizeclass = size_to_sizeclass(size);
        if (sizeclass as usize) < NUM_SMALL_CLASSES {
            // Most allocations are small; keep this arm first.
            let rsize = sizeclass_to_size(sizeclass);
            self.small_alloc(sizeclass, rsize, zero_mem, allow_reserve)
        } else if (sizeclass as usize) < NUM_SIZECLASSES {
            let rsize = sizeclass_to_size(sizeclass);
            self.medium_alloc(sizeclass, rsize, size, zero_mem, allow_reserve)
        } else {
            self.large_alloc(size, zero_mem, allow_reserve)
        }
    }

    /// Statically-sized allocation; the class is computed at compile time
    pub fn alloc_sized<const SIZE: usize>(
        &self,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> *mut u8 {
        const { assert!(SIZE != 0, "size must not be zero") };
        let sizeclass = const { size_to_sizeclass_const(SIZE) };

        self.handle_message_queue();

        if (sizeclass as usize) < NUM_SMALL_CLASSES {
            let rsize = const { sizeclass_to_size(size_to_sizeclass_const(SIZE)) };
            self.small_alloc(sizeclass, rsize, zero_mem, allow_reserve)
        } else if (sizeclass as usize) < NUM_SIZECLASSES {
            let rsize = const { sizeclass_to_size(size_to_sizeclass_const(SIZE)) };
            self.medium_alloc(sizeclass, rsize, SIZE, zero_mem, allow_reserve)
        } else {
            self.large_alloc(SIZE, zero_mem, allow_reserve)
        }
    }

    // ------------------------------------------------------------------
    // deallocation
    // ------------------------------------------------------------------

    /// Free `p` with a statically known size
    pub fn dealloc_sized<const SIZE: usize>(&self, p: *mut u8) {
        let sizeclass = const { size_to_sizeclass_const(SIZE) };
        self.handle_message_queue();
        self.dealloc_by_sizeclass(p, sizeclass, SIZE);
    }

    /// Free `p`, which was allocated with `size`
    pub fn dealloc_size(&self, p: *mut u8, size: usize) {
        self.handle_message_queue();
        self.dealloc_by_sizeclass(p, size_to_sizeclass(size), size);
    }

    fn dealloc_by_sizeclass(&self, p: *mut u8, sizeclass: u8, size: usize) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::dealloc", id = self.id());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(p));

        if (sizeclass as usize) < NUM_SMALL_CLASSES {
            let super_ = Superslab::get(p);
            let target = unsafe { Superslab::get_allocator(super_) };
            if ptr::eq(target, self.remote_alloc) {
                self.small_dealloc(super_, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
        } else if (sizeclass as usize) < NUM_SIZECLASSES {
            let slab = Mediumslab::get(p);
            let target = unsafe { Mediumslab::get_allocator(slab) };
            if ptr::eq(target, self.remote_alloc) {
                self.medium_dealloc(slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
        } else {
            self.large_dealloc(p, size);
        }
    }

    /// Free `p` with no size information: the pagemap recovers it
    pub fn dealloc(&self, p: *mut u8) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::dealloc", id = self.id());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(p));

        self.handle_message_queue();

        let tag = self.page_map.get(p as usize);
        if tag == PM_NOT_OURS {
            fatal("not allocated by this allocator");
        }

        let super_ = Superslab::get(p);
        if tag == PM_SUPERSLAB {
            let target = unsafe { Superslab::get_allocator(super_) };
            // Reading a remote sizeclass cannot misfire: the owner cannot
            // reuse the slab before this pointer is deallocated.
            let sizeclass = unsafe { Superslab::get_meta(super_, p) }.sizeclass();
            if ptr::eq(target, self.remote_alloc) {
                self.small_dealloc(super_, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
            return;
        }
        if tag == PM_MEDIUMSLAB {
            let slab = super_ as *mut Mediumslab;
            let target = unsafe { Mediumslab::get_allocator(slab) };
            let sizeclass = unsafe { Mediumslab::get_sizeclass(slab) };
            if ptr::eq(target, self.remote_alloc) {
                self.medium_dealloc(slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
            return;
        }

        // Large path: the tag is the head's size exponent. A redirect tag
        // or an interior pointer is not the start of an object.
        if tag >= PM_LARGE_REDIRECT_BASE || !ptr::eq(super_ as *const u8, p) {
            fatal("not deallocating start of an object");
        }
        self.large_dealloc(p, 1usize << tag);
    }

    // ------------------------------------------------------------------
    // mailbox
    // ------------------------------------------------------------------

    #[inline]
    fn handle_message_queue(&self) {
        // Inline the emptiness probe but not the drain.
        if self.remote_alloc.is_empty() {
            return;
        }
        self.handle_message_queue_inner();
    }

    #[inline(never)]
    fn handle_message_queue_inner(&self) {
        for _ in 0..REMOTE_BATCH {
            // safety: this allocator is the queue's only consumer
            let r = unsafe { self.remote_alloc.pop() };
            if r.is_null() {
                break;
            }
            if !self.remote_alloc.is_stub(r) {
                self.handle_dealloc_remote(r);
            }
        }

        // Forwarding may have grown the outgoing cache past the threshold.
        if self.remote.size() < REMOTE_CACHE {
            return;
        }
        self.post();
    }

    fn handle_dealloc_remote(&self, r: *mut Remote) {
        let sizeclass = unsafe { (*r).sizeclass() };
        let target_id = unsafe { (*r).target_id() };

        if target_id == self.id() {
            let p = r as *mut u8;
            if (sizeclass as usize) < NUM_SMALL_CLASSES {
                self.small_dealloc(Superslab::get(p), p, sizeclass);
            } else {
                self.medium_dealloc(Mediumslab::get(p), p, sizeclass);
            }
        } else {
            // Not ours: forward on the next post.
            self.remote.dealloc(target_id, r as *mut u8, sizeclass);
        }
    }

    fn remote_dealloc(&self, target: *const RemoteAllocator, p: *mut u8, sizeclass: u8) {
        self.remote
            .dealloc(unsafe { (*target).id() }, p, sizeclass);
        if self.remote.size() < REMOTE_CACHE {
            return;
        }
        self.post();
    }

    fn post(&self) {
        tracing::event!(Level::TRACE, id = self.id(), "remote post");
        // Each bucket chain is sent to the mailbox of its first object's
        // owner, read through the owner word every slab header leads with.
        self.remote.post(self.id(), |r| unsafe {
            Superslab::get_allocator(Superslab::get(r as *const u8))
        });
    }

    /// Drain the mailbox completely and post everything outgoing. Used at
    /// teardown and by quiescence points; the regular paths only ever do
    /// bounded batches.
    pub fn flush(&self) {
        // Cycle the stub through so the resident front message drains too.
        // safety: this allocator is the queue's only consumer
        unsafe { self.remote_alloc.push_stub() };
        loop {
            let r = unsafe { self.remote_alloc.pop() };
            if r.is_null() {
                break;
            }
            if !self.remote_alloc.is_stub(r) {
                self.handle_dealloc_remote(r);
            }
        }
        if self.remote.size() > 0 {
            self.post();
        }
    }

    // ------------------------------------------------------------------
    // small objects
    // ------------------------------------------------------------------

    fn small_alloc(
        &self,
        sizeclass: u8,
        rsize: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> *mut u8 {
        let sc = &self.small_classes[sizeclass as usize];
        let mut meta = sc.get_head();
        if meta.is_null() {
            meta = self.alloc_slab(sizeclass, allow_reserve);
            if meta.is_null() {
                return ptr::null_mut();
            }
            unsafe { sc.insert(meta) };
        }

        unsafe {
            let p = (*meta).alloc_cell();
            if (*meta).is_full() {
                sc.remove(meta);
            }
            if zero_mem == ZeroMem::YesZero {
                ptr::write_bytes(p, 0, rsize);
            }
            p
        }
    }

    fn get_superslab(&self, allow_reserve: AllowReserve) -> *mut Superslab {
        let super_ = self.super_available.get_head();
        if !super_.is_null() {
            return super_;
        }

        let p = self
            .large_allocator
            .alloc(0, ZeroMem::NoZero, allow_reserve);
        if p.is_null() {
            return ptr::null_mut();
        }

        let super_ = p as *mut Superslab;
        unsafe {
            Superslab::init(
                super_,
                self.remote_alloc,
                &self.large_allocator.memory_provider,
            );
            self.page_map.set_superslab(p as usize);
            self.super_available.insert(super_);
        }
        tracing::event!(Level::TRACE, id = self.id(), super_ = ?UsizePtr::from(p), "fresh superslab");
        super_
    }

    fn alloc_slab(&self, sizeclass: u8, allow_reserve: AllowReserve) -> *mut Metaslab {
        if is_short_sizeclass(sizeclass) {
            // Prefer superslabs that have nothing but their short slab left.
            let super_ = unsafe { self.super_only_short_available.pop() };
            if !super_.is_null() {
                let meta = unsafe { Superslab::alloc_short_slab(super_, sizeclass) };
                debug_assert!(unsafe { Superslab::is_full(super_) });
                return meta;
            }

            let super_ = self.get_superslab(allow_reserve);
            if super_.is_null() {
                return ptr::null_mut();
            }
            let meta = unsafe { Superslab::alloc_short_slab(super_, sizeclass) };
            self.reposition_superslab(super_);
            return meta;
        }

        let super_ = self.get_superslab(allow_reserve);
        if super_.is_null() {
            return ptr::null_mut();
        }
        let meta = unsafe { Superslab::alloc_slab(super_, sizeclass) };
        self.reposition_superslab(super_);
        meta
    }

    fn reposition_superslab(&self, super_: *mut Superslab) {
        match unsafe { Superslab::get_status(super_) } {
            Status::Full => unsafe {
                self.super_available.remove(super_);
            },
            Status::Available => {}
            Status::OnlyShortSlabAvailable => unsafe {
                self.super_available.remove(super_);
                self.super_only_short_available.insert(super_);
            },
            // Carving a slab cannot leave the superslab empty.
            Status::Empty => fatal("unreachable"),
        }
    }

    fn small_dealloc(&self, super_: *mut Superslab, p: *mut u8, sizeclass: u8) {
        if SAFE_CLIENT {
            let meta = unsafe { Superslab::get_meta(super_, p) };
            let rsize = sizeclass_to_size(sizeclass);
            let slab_end = meta.slab_base() as usize + SLAB_SIZE;
            if !is_multiple_of_sizeclass(rsize, slab_end - p as usize)
                || (p as usize) < meta.first_cell()
            {
                fatal("not deallocating start of an object");
            }
        }

        let was_full = unsafe { Superslab::is_full(super_) };
        let sc = &self.small_classes[sizeclass as usize];
        let action = unsafe { slab_dealloc(super_, sc, p) };
        if action != Action::StatusChange {
            return;
        }

        match unsafe { Superslab::get_status(super_) } {
            // A returned slab can only add free space.
            Status::Full => fatal("unreachable"),

            Status::Available => unsafe {
                if was_full {
                    self.super_available.insert(super_);
                } else {
                    self.super_only_short_available.remove(super_);
                    self.super_available.insert(super_);
                }
            },

            Status::OnlyShortSlabAvailable => unsafe {
                self.super_only_short_available.insert(super_);
            },

            Status::Empty => unsafe {
                self.super_available.remove(super_);

                if DECOMMIT_STRATEGY != DecommitStrategy::None {
                    self.large_allocator.memory_provider.notify_not_using(
                        (super_ as *mut u8).add(OS_PAGE_SIZE),
                        SUPERSLAB_SIZE - OS_PAGE_SIZE,
                    );
                }

                self.page_map.clear_superslab(super_ as usize);
                self.large_allocator.dealloc(super_ as *mut u8, 0);
            },
        }
    }

    // ------------------------------------------------------------------
    // medium objects
    // ------------------------------------------------------------------

    fn medium_alloc(
        &self,
        sizeclass: u8,
        rsize: usize,
        size: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> *mut u8 {
        let sc = &self.medium_classes[sizeclass as usize - NUM_SMALL_CLASSES];

        let slab = sc.get_head();
        if !slab.is_null() {
            unsafe {
                let p = Mediumslab::alloc(slab, rsize, size, zero_mem);
                if Mediumslab::full(slab) {
                    sc.remove(slab);
                }
                return p;
            }
        }

        let block = self
            .large_allocator
            .alloc(0, ZeroMem::NoZero, allow_reserve);
        if block.is_null() {
            return ptr::null_mut();
        }

        let slab = block as *mut Mediumslab;
        unsafe {
            Mediumslab::init(slab, self.remote_alloc, sizeclass, rsize);
            self.page_map.set_mediumslab(block as usize);
            let p = Mediumslab::alloc(slab, rsize, size, zero_mem);
            if !Mediumslab::full(slab) {
                sc.insert(slab);
            }
            p
        }
    }

    fn medium_dealloc(&self, slab: *mut Mediumslab, p: *mut u8, sizeclass: u8) {
        let rsize = sizeclass_to_size(sizeclass);
        if SAFE_CLIENT
            && !is_multiple_of_sizeclass(rsize, slab as usize + SUPERSLAB_SIZE - p as usize)
        {
            fatal("not deallocating start of an object");
        }

        let was_full = unsafe { Mediumslab::dealloc(slab, p, rsize) };
        let sc = &self.medium_classes[sizeclass as usize - NUM_SMALL_CLASSES];

        if unsafe { Mediumslab::empty(slab) } {
            // A full slab was not on the class list.
            if !was_full {
                unsafe { sc.remove(slab) };
            }

            if DECOMMIT_STRATEGY != DecommitStrategy::None {
                self.large_allocator.memory_provider.notify_not_using(
                    unsafe { (slab as *mut u8).add(OS_PAGE_SIZE) },
                    SUPERSLAB_SIZE - OS_PAGE_SIZE,
                );
            }

            self.page_map.clear_mediumslab(slab as usize);
            self.large_allocator.dealloc(slab as *mut u8, 0);
        } else if was_full {
            unsafe { sc.insert(slab) };
        }
    }

    // ------------------------------------------------------------------
    // large objects
    // ------------------------------------------------------------------

    fn large_alloc(&self, size: usize, zero_mem: ZeroMem, allow_reserve: AllowReserve) -> *mut u8 {
        let size_bits = next_pow2_bits(size);
        let large_class = size_bits - crate::config::SUPERSLAB_BITS;

        let p = self
            .large_allocator
            .alloc(large_class, zero_mem, allow_reserve);
        if p.is_null() {
            return ptr::null_mut();
        }
        self.page_map.set_large_size(p as usize, size);
        p
    }

    fn large_dealloc(&self, p: *mut u8, size: usize) {
        let size_bits = next_pow2_bits(size);
        let rsize = 1usize << size_bits;
        let large_class = size_bits - crate::config::SUPERSLAB_BITS;

        self.page_map.clear_large_size(p as usize, size);

        // Must match LargeAlloc::tail_decommitted, which the reuse-zeroing
        // path trusts.
        if DECOMMIT_STRATEGY == DecommitStrategy::All || large_class > 0 {
            self.large_allocator.memory_provider.notify_not_using(
                unsafe { p.add(OS_PAGE_SIZE) },
                rsize - OS_PAGE_SIZE,
            );
        }

        self.large_allocator.dealloc(p, large_class);
    }
}

// ----------------------------------------------------------------------
// pointer introspection (global pagemap)
// ----------------------------------------------------------------------

/// Recover the first or last byte of the allocation containing `p`.
///
/// Lenient on unknown addresses: returns null (`Start`) or the maximum
/// address (`End`) instead of faulting, which `malloc_usable_size`-style
/// shims rely on.
pub fn external_pointer(p: *const u8, location: Boundary) -> *mut u8 {
    let map = SuperslabMap;
    let mut tag = map.get(p as usize);
    let super_ = Superslab::get(p);

    if tag == PM_SUPERSLAB {
        let meta = unsafe { Superslab::get_meta(super_, p) };
        let slab_end = meta.slab_base() as usize + SLAB_SIZE - 1;
        return external_pointer_in_cell(p, meta.sizeclass(), slab_end, location);
    }
    if tag == PM_MEDIUMSLAB {
        let sizeclass = unsafe { Mediumslab::get_sizeclass(super_ as *const Mediumslab) };
        let slab_end = super_ as usize + SUPERSLAB_SIZE - 1;
        return external_pointer_in_cell(p, sizeclass, slab_end, location);
    }

    // Follow the redirect slide back to the large head: each entry says how
    // far back (log2 bytes) to jump, halving the remaining distance.
    let mut ss = super_ as usize;
    while tag > PM_LARGE_REDIRECT_BASE {
        ss -= 1usize << (tag - PM_LARGE_REDIRECT_BASE) as usize;
        tag = map.get(ss);
    }

    if tag == PM_NOT_OURS {
        return match location {
            Boundary::Start => ptr::null_mut(),
            Boundary::End => usize::MAX as *mut u8,
        };
    }

    match location {
        Boundary::Start => ss as *mut u8,
        Boundary::End => (ss + (1usize << tag) - 1) as *mut u8,
    }
}

/// Cell-granularity boundary recovery: cells sit at multiples of the class
/// size back from the slab end
fn external_pointer_in_cell(
    p: *const u8,
    sizeclass: u8,
    end_point: usize,
    location: Boundary,
) -> *mut u8 {
    let rsize = sizeclass_to_size(sizeclass);
    let end_point_correction = match location {
        Boundary::End => end_point,
        Boundary::Start => end_point - rsize + 1,
    };
    let offset_from_end = end_point - p as usize;
    let end_to_end = round_by_sizeclass(rsize, offset_from_end);
    (end_point_correction - end_to_end) as *mut u8
}

/// Allocated cell size backing `p`, which must be a pointer this allocator
/// family handed out. Aborts on foreign pointers.
pub fn alloc_size(p: *const u8) -> usize {
    let map = SuperslabMap;
    let tag = map.get(p as usize);

    if tag == PM_NOT_OURS {
        fatal("not allocated by this allocator");
    }
    if tag == PM_SUPERSLAB {
        let super_ = Superslab::get(p);
        let meta = unsafe { Superslab::get_meta(super_, p) };
        return sizeclass_to_size(meta.sizeclass());
    }
    if tag == PM_MEDIUMSLAB {
        return sizeclass_to_size(unsafe { Mediumslab::get_sizeclass(Mediumslab::get(p)) });
    }
    1usize << tag
}

#[cfg(all(test, not(loom)))]
mod tests;
