//! Remote deallocation plumbing.
//!
//! Freed objects that belong to another allocator are batched in a
//! [RemoteCache] and posted to the owning allocator's [RemoteAllocator]
//! mailbox, an intrusive single-consumer multi-producer queue. The freed
//! object's own memory carries the message ([Remote]).

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::config::{REMOTE_MASK, REMOTE_SLOTS, REMOTE_SLOT_BITS};
use crate::loom_testing::*;
use crate::sizeclass::sizeclass_to_size;

pub type AllocId = usize;

/// Reserved id; the pool must never mint it
pub const INVALID_ALLOC_ID: AllocId = usize::MAX;

const SIZECLASS_SHIFT: usize = 56;
const TARGET_MASK: usize = (1 << SIZECLASS_SHIFT) - 1;

/// Header overlaid onto a freed object while it travels between allocators.
///
/// Word 0 is the intrusive queue/list link; word 1 packs the destination
/// allocator id (low 56 bits) with the object's sizeclass (top 8 bits).
/// Overwriting the object is legal because it is dead to the user, and the
/// words stay readable because the owning allocator cannot reuse the slab
/// while this object is still outstanding in a queue.
#[repr(C)]
pub struct Remote {
    // Plain (relaxed) atomics: cross-thread visibility of a whole chain
    // rides on the queue's swap-release / load-acquire pair, never on the
    // individual link stores.
    next: AtomicUsize,
    value: AtomicUsize,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<Remote>() == crate::sizeclass::MIN_ALLOC_SIZE);

impl Remote {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            value: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn next(&self) -> *mut Remote {
        self.next.load(Ordering::Relaxed) as *mut Remote
    }

    #[inline]
    pub fn set_next(&self, next: *mut Remote) {
        self.next.store(next as usize, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_target_and_sizeclass(&self, target_id: AllocId, sizeclass: u8) {
        debug_assert_eq!(target_id & !TARGET_MASK, 0);
        self.value.store(
            ((sizeclass as usize) << SIZECLASS_SHIFT) | target_id,
            Ordering::Relaxed,
        );
    }

    #[inline]
    pub fn target_id(&self) -> AllocId {
        self.value.load(Ordering::Relaxed) & TARGET_MASK
    }

    #[inline]
    pub fn sizeclass(&self) -> u8 {
        (self.value.load(Ordering::Relaxed) >> SIZECLASS_SHIFT) as u8
    }
}

/// One allocator's public face: its stable id and its mailbox.
///
/// Heap-boxed by the owning allocator so that superslab headers can hold a
/// raw pointer to it across moves of the allocator itself.
pub struct RemoteAllocator {
    id: AllocId,
    /// Producer end; pushers swap themselves in and release-link the
    /// previous back's `next`
    back: AtomicPtr<Remote>,
    /// Consumer end. Atomic only so the emptiness probe stays race-free;
    /// it is written by the single consumer that owns this mailbox.
    front: AtomicPtr<Remote>,
    /// Resident sentinel so `front` is never null and the first real
    /// message always has a predecessor to be linked through
    stub: Remote,
}

impl RemoteAllocator {
    pub fn new(id: AllocId) -> Box<Self> {
        assert!(id != INVALID_ALLOC_ID, "id must not be the reserved value");
        assert_eq!(id & !TARGET_MASK, 0, "id too large for the header packing");
        let queue = Box::new(Self {
            id,
            back: AtomicPtr::new(ptr::null_mut()),
            front: AtomicPtr::new(ptr::null_mut()),
            stub: Remote::new(),
        });
        let stub = &queue.stub as *const Remote as *mut Remote;
        queue.back.store(stub, Ordering::Relaxed);
        queue.front.store(stub, Ordering::Relaxed);
        queue
    }

    pub fn id(&self) -> AllocId {
        self.id
    }

    pub fn is_stub(&self, p: *const Remote) -> bool {
        ptr::eq(p, &self.stub)
    }

    /// Non-blocking emptiness probe for the fast path. May report empty
    /// while a push's link store is still in flight; the next drain picks
    /// that message up.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.back.load(Ordering::Relaxed) == self.front.load(Ordering::Relaxed)
    }

    /// Append a null-terminated chain `first..=last`. Callable from any
    /// thread.
    pub fn push(&self, first: *mut Remote, last: *mut Remote) {
        unsafe {
            (*last).set_next(ptr::null_mut());
        }
        // order: the swap is relaxed because the only write we publish is
        // the link store below; release on that store makes the whole
        // chain's contents visible to the consumer's acquiring load of
        // `next`. Intermediate swaps form the release sequence from older
        // pushes, so the consumer synchronizes with all of them.
        let prev = self.back.swap(last, Ordering::Relaxed);
        unsafe {
            (*prev).next.store(first as usize, Ordering::Release);
        }
    }

    /// Re-enqueue the stub so the resident front node can be drained.
    /// No-op while the stub is already at the front (fresh queue, or one
    /// drained down to it), which is the only state where the stub can
    /// still be in the queue.
    ///
    /// Safety: only the single consumer owning this mailbox may call this.
    pub unsafe fn push_stub(&self) {
        if self.is_stub(self.front.load(Ordering::Relaxed)) {
            return;
        }
        let stub = &self.stub as *const Remote as *mut Remote;
        self.push(stub, stub);
    }

    /// Take one node off the consumer end, or null if nothing is linked
    /// yet. The caller must skip the node if [is_stub](Self::is_stub) says
    /// so.
    ///
    /// Safety: only the single consumer owning this mailbox may call this;
    /// a second concurrent popper would dispatch the same node twice.
    pub unsafe fn pop(&self) -> *mut Remote {
        let first = self.front.load(Ordering::Relaxed);
        // order: acquire pairs with the producers' release link store, so
        // the popped node's value word (and the rest of its chain) is
        // visible before dispatch
        let next = (*first).next.load(Ordering::Acquire) as *mut Remote;
        if next.is_null() {
            return ptr::null_mut();
        }
        self.front.store(next, Ordering::Relaxed);
        first
    }
}

/// One outgoing bucket: a null-terminated chain with O(1) append
struct RemoteList {
    head: Cell<*mut Remote>,
    last: Cell<*mut Remote>,
}

impl RemoteList {
    fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            last: Cell::new(ptr::null_mut()),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.get().is_null()
    }

    unsafe fn append(&self, r: *mut Remote) {
        (*r).set_next(ptr::null_mut());
        let last = self.last.get();
        if last.is_null() {
            self.head.set(r);
        } else {
            (*last).set_next(r);
        }
        self.last.set(r);
    }

    /// Detach the whole chain, leaving the bucket empty
    fn take(&self) -> (*mut Remote, *mut Remote) {
        let chain = (self.head.get(), self.last.get());
        self.head.set(ptr::null_mut());
        self.last.set(ptr::null_mut());
        chain
    }
}

/// Outgoing batcher: objects freed here on behalf of other allocators,
/// bucketed by the low bits of their target id until posted
pub struct RemoteCache {
    size: Cell<usize>,
    lists: [RemoteList; REMOTE_SLOTS],
}

impl RemoteCache {
    pub fn new() -> Self {
        Self {
            size: Cell::new(0),
            lists: std::array::from_fn(|_| RemoteList::new()),
        }
    }

    /// Running byte count of everything batched since the last post
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Stamp the freed object with its destination and bucket it
    pub fn dealloc(&self, target_id: AllocId, p: *mut u8, sizeclass: u8) {
        self.size
            .set(self.size.get() + sizeclass_to_size(sizeclass));

        let r = p as *mut Remote;
        unsafe {
            (*r).set_target_and_sizeclass(target_id, sizeclass);
            debug_assert_eq!((*r).sizeclass(), sizeclass);
            debug_assert_eq!((*r).target_id(), target_id);
            self.lists[target_id & REMOTE_MASK].append(r);
        }
    }

    /// Flush every bucket to its targets' mailboxes.
    ///
    /// Each bucket chain is pushed whole to the mailbox of the *first*
    /// object's owner (resolved by `owner_of`, normally pagemap + superslab
    /// header); the receiver forwards anything in the chain that is not its
    /// own. The local bucket is instead redistributed by the next
    /// [REMOTE_SLOT_BITS] of the target ids and the pass repeats, so after
    /// `ceil(id_bits / REMOTE_SLOT_BITS)` rounds the local bucket is empty
    /// and the loop terminates.
    pub fn post(&self, id: AllocId, owner_of: impl Fn(*mut Remote) -> *const RemoteAllocator) {
        self.size.set(0);
        let mut shift = 0;

        loop {
            let my_slot = (id >> shift) & REMOTE_MASK;

            for i in 0..REMOTE_SLOTS {
                if i == my_slot || self.lists[i].is_empty() {
                    continue;
                }
                let (first, last) = self.lists[i].take();
                let target = owner_of(first);
                unsafe {
                    (*target).push(first, last);
                }
            }

            if self.lists[my_slot].is_empty() {
                break;
            }

            // Entries could map back onto the same slot, so detach the
            // chain before redistributing node by node.
            let (mut r, _) = self.lists[my_slot].take();
            shift += REMOTE_SLOT_BITS;

            while !r.is_null() {
                unsafe {
                    let next = (*r).next();
                    let slot = ((*r).target_id() >> shift) & REMOTE_MASK;
                    self.lists[slot].append(r);
                    r = next;
                }
            }
        }
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;

    #[test]
    fn mailbox_two_producers() {
        loom::model(|| {
            let q: &'static RemoteAllocator = Box::leak(RemoteAllocator::new(1));

            let mk = |tag: usize| -> *mut Remote {
                let r = Box::leak(Box::new(Remote::new()));
                r.set_target_and_sizeclass(tag, 0);
                r as *mut Remote
            };

            let t0 = loom::thread::spawn(move || {
                let a = mk(10);
                q.push(a, a);
            });
            let t1 = loom::thread::spawn(move || {
                let b = mk(20);
                q.push(b, b);
            });
            t0.join().unwrap();
            t1.join().unwrap();

            // drain; push a flusher so both real messages can come off
            let f = mk(0);
            q.push(f, f);
            let mut seen = Vec::new();
            loop {
                let p = unsafe { q.pop() };
                if p.is_null() {
                    break;
                }
                if !q.is_stub(p) {
                    seen.push(unsafe { (*p).target_id() });
                }
            }
            seen.sort_unstable();
            assert_eq!(seen, vec![10, 20]);
        });
    }
}
