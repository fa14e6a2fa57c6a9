use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};

use super::*;
use crate::config::{REMOTE_SLOTS, SLAB_COUNT};
use crate::mediumslab::medium_cell_count;
use crate::superslab::slab_cell_count;
use crate::util::_debug_hexdump;

fn assert_send<T: Send>() {}

/// Ids must be unique process-wide; tests run in parallel.
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

fn next_id() -> AllocId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn test_alloc() -> Allocator {
    Allocator::with_id(next_id())
}

#[test]
fn allocator_is_send() {
    assert_send::<Allocator>();
}

/// Pagemap stub that records every write while still delegating to the
/// global map, so the engines under it keep working
#[derive(Default)]
struct RecordingMap {
    writes: RefCell<Vec<usize>>,
}

impl PageMap for &RecordingMap {
    fn get(&self, addr: usize) -> u8 {
        SuperslabMap.get(addr)
    }
    fn set_superslab(&self, addr: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.set_superslab(addr);
    }
    fn clear_superslab(&self, addr: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.clear_superslab(addr);
    }
    fn set_mediumslab(&self, addr: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.set_mediumslab(addr);
    }
    fn clear_mediumslab(&self, addr: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.clear_mediumslab(addr);
    }
    fn set_large_size(&self, addr: usize, size: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.set_large_size(addr, size);
    }
    fn clear_large_size(&self, addr: usize, size: usize) {
        self.writes.borrow_mut().push(addr);
        SuperslabMap.clear_large_size(addr, size);
    }
}

#[test]
fn small_round_trip_touches_only_its_own_superslab() {
    let map = RecordingMap::default();
    let a = Allocator::new(next_id(), VirtualProvider, &map);

    let p = a.alloc(48);
    assert!(!p.is_null());
    unsafe { ptr::write_bytes(p, 0x5A, 48) };
    let base = Superslab::get(p) as usize;

    a.dealloc_size(p, 48);
    let q = a.alloc(48);
    // deterministic: the recycled superslab re-carves the same short slab
    assert_eq!(q, p);

    // every pagemap write of the whole exchange hit this superslab's entry
    {
        let writes = map.writes.borrow();
        assert!(!writes.is_empty());
        assert!(writes.iter().all(|&addr| addr == base));
    }
    a.dealloc_size(q, 48);
}

#[test]
fn cross_thread_free_returns_to_owner() {
    let a = test_alloc();
    let p = a.alloc(128);
    assert!(!p.is_null());
    unsafe { ptr::write_bytes(p, 0xC3, 128) };

    let (tx, rx) = mpsc::channel::<usize>();
    tx.send(p as usize).unwrap();
    let b_id = next_id();
    let t = std::thread::spawn(move || {
        let b = Allocator::with_id(b_id);
        let p = rx.recv().unwrap() as *mut u8;
        b.dealloc_size(p, 128);
        b.flush();
    });
    t.join().unwrap();

    // any call on A drains its mailbox; the region classification is intact
    let x = a.alloc(1);
    assert_eq!(
        SuperslabMap.get(p as usize),
        crate::pagemap::PM_SUPERSLAB
    );

    // after a full drain the slot is reusable by the matching class
    a.flush();
    let q = a.alloc(128);
    assert_eq!(q, p);

    a.dealloc_size(x, 1);
    a.dealloc_size(q, 128);
}

#[test]
fn large_boundary_and_reuse() {
    let a = test_alloc();
    let size = 17 << 20;
    let p = a.alloc(size);
    assert!(!p.is_null());
    assert_eq!(p as usize % SUPERSLAB_SIZE, 0);
    assert_eq!(alloc_size(p), 32 << 20);

    let interior = unsafe { p.add(20 << 20) };
    assert_eq!(external_pointer(interior, Boundary::Start), p);
    assert_eq!(
        external_pointer(interior, Boundary::End) as usize,
        p as usize + (32 << 20) - 1
    );

    a.dealloc(p);
    let q = a.alloc(32 << 20);
    assert_eq!(q, p);
    a.dealloc_size(q, 32 << 20);
}

#[test]
fn superslab_recycles_through_the_large_allocator() {
    let a = test_alloc();

    // fill the short slab plus two regular slabs of the 16-byte class
    let total = slab_cell_count(true, 16) + 2 * slab_cell_count(false, 16);
    let mut ptrs = Vec::with_capacity(total);
    for _ in 0..total {
        ptrs.push(a.alloc(16));
    }
    let base = Superslab::get(ptrs[0]) as usize;
    for p in &ptrs {
        assert_eq!(Superslab::get(*p) as usize, base);
    }
    assert_eq!(SuperslabMap.get(base), crate::pagemap::PM_SUPERSLAB);

    for p in &ptrs {
        a.dealloc_size(*p, 16);
    }
    // the empty superslab left the pagemap and went back to class 0
    assert_eq!(SuperslabMap.get(base), crate::pagemap::PM_NOT_OURS);

    let q = a.alloc(SUPERSLAB_SIZE);
    assert_eq!(q as usize, base);
    a.dealloc_size(q, SUPERSLAB_SIZE);
}

#[test]
fn zeroed_alloc_after_dirty_use() {
    let a = test_alloc();
    let p = a.alloc(4096);
    unsafe { ptr::write_bytes(p, 0xAA, 4096) };
    a.dealloc_size(p, 4096);

    let q = a.alloc_opts(4096, ZeroMem::YesZero, AllowReserve::YesReserve);
    assert!(!q.is_null());
    unsafe {
        for i in 0..4096 {
            assert_eq!(*q.add(i), 0, "byte {} not zeroed", i);
        }
    }
    a.dealloc_size(q, 4096);
}

#[test]
fn remote_cache_posts_by_threshold_in_fifo_order() {
    // REMOTE_SLOTS + 1 owners force at least one shared cache bucket
    let n = REMOTE_SLOTS + 1;
    let targets: Vec<Allocator> = (0..n)
        .map(|i| Allocator::with_id(1_000_000 + i))
        .collect();
    let freer = Allocator::with_id(999_999);

    let size = 16 << 10;
    // three objects per target; the third stays live so the slab survives
    // the round trip and its free-list order stays observable
    let objs: Vec<[*mut u8; 3]> = targets
        .iter()
        .map(|t| [t.alloc(size), t.alloc(size), t.alloc(size)])
        .collect();

    // Freeing everything crosses REMOTE_CACHE and triggers posting from
    // inside the dealloc path; the remainder goes out with the flush.
    for trio in &objs {
        freer.dealloc_size(trio[0], size);
        freer.dealloc_size(trio[1], size);
    }

    // A shared bucket's chain lands whole on one owner, who forwards the
    // rest; a few settle rounds deliver everything.
    for _ in 0..3 {
        freer.flush();
        for t in &targets {
            t.flush();
        }
    }

    // Per-target FIFO delivery: the frees arrived in order, so the slab
    // free list returns them LIFO.
    for (t, trio) in targets.iter().zip(&objs) {
        let q2 = t.alloc(size);
        let q1 = t.alloc(size);
        assert_eq!(q2, trio[1]);
        assert_eq!(q1, trio[0]);
    }
}

#[test]
fn remote_free_closure_across_threads() {
    const THREADS: usize = 4;
    const OBJS: usize = 100;
    const SIZE: usize = 1024;

    let barrier = Arc::new(Barrier::new(THREADS));
    let mut txs = Vec::new();
    let mut rxs = Vec::new();
    for _ in 0..THREADS {
        let (tx, rx) = mpsc::channel::<usize>();
        txs.push(tx);
        rxs.push(rx);
    }
    rxs.reverse();

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let barrier = Arc::clone(&barrier);
        let tx = txs[(t + 1) % THREADS].clone();
        let rx = rxs.pop().unwrap();
        handles.push(std::thread::spawn(move || {
            let a = Allocator::with_id(2_000_000 + t);

            let mine: Vec<usize> = (0..OBJS).map(|_| a.alloc(SIZE) as usize).collect();
            let supers: HashSet<usize> = mine
                .iter()
                .map(|&p| Superslab::get(p as *const u8) as usize)
                .collect();
            for &p in &mine {
                tx.send(p).unwrap();
            }
            barrier.wait();

            for _ in 0..OBJS {
                let p = rx.recv().unwrap();
                a.dealloc_size(p as *mut u8, SIZE);
            }
            barrier.wait();

            // everyone posts, then everyone drains, until quiescent
            for _ in 0..3 {
                a.flush();
                barrier.wait();
            }

            // every freed cell came home: reallocation stays inside the
            // superslabs this thread already owned
            let again: Vec<usize> = (0..OBJS).map(|_| a.alloc(SIZE) as usize).collect();
            for &p in &again {
                assert!(supers.contains(&(Superslab::get(p as *const u8) as usize)));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn external_pointer_small_medium_and_unknown() {
    let a = test_alloc();

    let p = a.alloc(48);
    for i in [0usize, 1, 24, 47] {
        let interior = unsafe { p.add(i) };
        assert_eq!(external_pointer(interior, Boundary::Start), p);
        assert_eq!(external_pointer(interior, Boundary::End) as usize, p as usize + 47);
    }

    let msize = 80 << 10;
    let m = a.alloc(msize);
    for i in [0usize, 1, msize / 2, msize - 1] {
        let interior = unsafe { m.add(i) };
        assert_eq!(external_pointer(interior, Boundary::Start), m);
        assert_eq!(
            external_pointer(interior, Boundary::End) as usize,
            m as usize + msize - 1
        );
    }

    // unknown addresses are answered leniently, not fatally
    let unknown = 16 as *const u8;
    assert!(external_pointer(unknown, Boundary::Start).is_null());
    assert_eq!(external_pointer(unknown, Boundary::End) as usize, usize::MAX);

    a.dealloc_size(p, 48);
    a.dealloc_size(m, msize);
}

#[test]
fn alloc_size_reports_cell_sizes() {
    let a = test_alloc();
    let s = a.alloc(100);
    assert_eq!(alloc_size(s), 112);
    let m = a.alloc(100 << 10);
    assert_eq!(alloc_size(m), 112 << 10);
    let l = a.alloc(SUPERSLAB_SIZE + 1);
    assert_eq!(alloc_size(l), 2 * SUPERSLAB_SIZE);
    a.dealloc_size(s, 100);
    a.dealloc_size(m, 100 << 10);
    a.dealloc_size(l, SUPERSLAB_SIZE + 1);
}

#[test]
fn pagemap_tags_for_live_pointers() {
    let a = test_alloc();
    let s = a.alloc(100);
    assert_eq!(SuperslabMap.get(s as usize), crate::pagemap::PM_SUPERSLAB);
    let m = a.alloc(100 << 10);
    assert_eq!(SuperslabMap.get(m as usize), crate::pagemap::PM_MEDIUMSLAB);

    let lsize = 48 << 20; // rounds to 64 MiB, a four-superslab slide
    let l = a.alloc(lsize);
    assert_eq!(SuperslabMap.get(l as usize) as usize, 26);
    for i in 1..4usize {
        let mut ss = l as usize + i * SUPERSLAB_SIZE;
        let mut steps = 0;
        let mut tag = SuperslabMap.get(ss);
        while tag > crate::pagemap::PM_LARGE_REDIRECT_BASE {
            ss -= 1usize << (tag - crate::pagemap::PM_LARGE_REDIRECT_BASE) as usize;
            tag = SuperslabMap.get(ss);
            steps += 1;
        }
        assert_eq!(ss, l as usize);
        assert!(steps <= 2);
    }

    a.dealloc_size(s, 100);
    a.dealloc_size(m, 100 << 10);
    a.dealloc_size(l, lsize);
}

#[test]
fn short_slab_is_preferred_once_only_it_remains() {
    let a = test_alloc();

    // 16 KiB cells are not short-eligible: they fill the 255 regular slabs
    let per_slab = slab_cell_count(false, 16 << 10);
    let mut ptrs = Vec::new();
    for _ in 0..(SLAB_COUNT - 1) * per_slab {
        ptrs.push(a.alloc(16 << 10));
    }
    let base = Superslab::get(ptrs[0]);
    for p in &ptrs {
        assert_eq!(Superslab::get(*p), base);
    }

    // only the short slab is left; a short-eligible class gets it
    let small = a.alloc(64);
    assert_eq!(Superslab::get(small), base);
    unsafe { assert!(Superslab::is_full(base)) };

    // walk the status machine back down: Full -> OnlyShort -> Available -> Empty
    a.dealloc_size(small, 64);
    unsafe {
        assert_eq!(
            Superslab::get_status(base),
            crate::superslab::Status::OnlyShortSlabAvailable
        );
    }
    for p in &ptrs {
        a.dealloc_size(*p, 16 << 10);
    }
    assert_eq!(
        SuperslabMap.get(base as usize),
        crate::pagemap::PM_NOT_OURS
    );
}

#[test]
fn medium_class_list_cycling() {
    let a = test_alloc();
    let size = SLAB_SIZE; // first medium class
    let cells = medium_cell_count(size);

    let mut ptrs = Vec::with_capacity(cells);
    for _ in 0..cells {
        ptrs.push(a.alloc(size));
    }
    let first_slab = Mediumslab::get(ptrs[0]);

    // the full slab left the class list; the next alloc opens a new one
    let extra = a.alloc(size);
    assert_ne!(Mediumslab::get(extra), first_slab);

    // freeing into the full slab puts it back at the head of the list
    a.dealloc_size(ptrs[0], size);
    let r = a.alloc(size);
    assert_eq!(r, ptrs[0]);

    for p in &ptrs[1..] {
        a.dealloc_size(*p, size);
    }
    a.dealloc_size(r, size);
    a.dealloc_size(extra, size);
    assert_eq!(
        SuperslabMap.get(first_slab as usize),
        crate::pagemap::PM_NOT_OURS
    );
}

#[test]
fn unknown_size_dealloc_local_and_remote() {
    let a = test_alloc();
    let b = test_alloc();

    // local small, size recovered from the metaslab
    let p = a.alloc(100);
    a.dealloc(p);
    let q = a.alloc(100);
    assert_eq!(q, p);
    a.dealloc_size(q, 100);

    // remote medium, size recovered from the mediumslab header
    let m = a.alloc(128 << 10);
    b.dealloc(m);
    b.flush();
    a.flush();
    let m2 = a.alloc(128 << 10);
    assert_eq!(m2, m);
    a.dealloc_size(m2, 128 << 10);
}

#[test]
fn no_reserve_uses_only_cached_space() {
    let a = test_alloc();
    assert!(a
        .alloc_opts(64, ZeroMem::NoZero, AllowReserve::NoReserve)
        .is_null());

    let p = a.alloc(64);
    a.dealloc_size(p, 64);
    // the recycled superslab satisfies the request without reserving
    let q = a.alloc_opts(64, ZeroMem::NoZero, AllowReserve::NoReserve);
    assert_eq!(q, p);
    a.dealloc_size(q, 64);
}

#[test]
fn const_sized_surface_matches_runtime() {
    let a = test_alloc();
    let p = a.alloc_sized::<48>(ZeroMem::NoZero, AllowReserve::YesReserve);
    assert_eq!(alloc_size(p), 48);
    a.dealloc_sized::<48>(p);
    let q = a.alloc(48);
    assert_eq!(q, p);
    a.dealloc_size(q, 48);

    let m = a.alloc_sized::<{ 80 << 10 }>(ZeroMem::NoZero, AllowReserve::YesReserve);
    assert_eq!(alloc_size(m), 80 << 10);
    a.dealloc_sized::<{ 80 << 10 }>(m);
}

#[test]
#[ignore = "not automated, human eye verified"]
fn superslab_header_dump() {
    let a = test_alloc();
    let p = a.alloc(48);
    let base = Superslab::get(p);
    print!("{}", unsafe {
        _debug_hexdump(base as *const u8, 256).unwrap()
    });
    a.dealloc_size(p, 48);
}

#[test]
#[should_panic(expected = "not allocated")]
fn dealloc_foreign_pointer_is_fatal() {
    let a = test_alloc();
    let x = Box::into_raw(Box::new(0u8));
    a.dealloc(x);
}

#[test]
#[should_panic(expected = "start of an object")]
fn dealloc_large_interior_is_fatal() {
    let a = test_alloc();
    let p = a.alloc(32 << 20);
    a.dealloc(unsafe { p.add(SUPERSLAB_SIZE) });
}

#[test]
fn randomized_mixed_sizes_never_overlap() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let a = test_alloc();

    let mut live: Vec<(usize, usize, u8)> = Vec::new();
    for step in 0..4000usize {
        if live.is_empty() || (live.len() < 300 && rng.gen_bool(0.6)) {
            let size = match rng.gen_range(0..10) {
                0..=6 => rng.gen_range(1..=1024),
                7 | 8 => rng.gen_range(1024..=SLAB_SIZE),
                _ => rng.gen_range(SLAB_SIZE..=SUPERSLAB_SIZE / 8),
            };
            let p = a.alloc(size);
            assert!(!p.is_null());
            let tag = (step & 0xff) as u8;
            unsafe {
                *p = tag;
                *p.add(size - 1) = tag;
            }
            for &(q, qs, _) in &live {
                let p = p as usize;
                assert!(p + size <= q || q + qs <= p, "live allocations overlap");
            }
            live.push((p as usize, size, tag));
        } else {
            let i = rng.gen_range(0..live.len());
            let (p, size, tag) = live.swap_remove(i);
            unsafe {
                assert_eq!(*(p as *const u8), tag);
                assert_eq!(*((p + size - 1) as *const u8), tag);
            }
            a.dealloc_size(p as *mut u8, size);
        }
    }
    for (p, size, _) in live.drain(..) {
        a.dealloc_size(p as *mut u8, size);
    }
}
