//! Source of raw address space.
//!
//! The allocator only ever asks its provider for superslab-aligned,
//! zero-on-first-touch regions, and hints ranges back with
//! [MemoryProvider::notify_not_using] when the decommit policy says so.
//! Reserved ranges are never unmapped; recycling happens entirely inside the
//! large-allocator free lists.

use std::ptr;

use crate::config::OS_PAGE_SIZE;
use crate::util::roundto;

pub trait MemoryProvider {
    /// Reserve `size` bytes of zero-initialized address space at an
    /// `align`-aligned base (power of two). Returns null on exhaustion.
    fn reserve(&self, size: usize, align: usize) -> *mut u8;

    /// Advise the OS that the (page-aligned) range's contents may be
    /// discarded. A later read observes zeroes.
    fn notify_not_using(&self, p: *mut u8, size: usize);

    /// Reverse of [notify_not_using](Self::notify_not_using); may be called
    /// before the first touch after a decommit hint.
    fn notify_using(&self, p: *mut u8, size: usize);
}

/// Default provider backed by anonymous private mappings
#[derive(Clone, Copy, Default)]
pub struct VirtualProvider;

impl MemoryProvider for VirtualProvider {
    fn reserve(&self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        debug_assert_eq!(size % OS_PAGE_SIZE, 0);

        // Over-map by the alignment, then trim the misaligned head and the
        // leftover tail back to the OS.
        let slack = if align > OS_PAGE_SIZE { align } else { 0 };
        let request = size + slack;
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                request,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return ptr::null_mut();
        }

        let base = p as usize;
        let aligned = roundto(base, align);
        let head = aligned - base;
        let tail = request - head - size;
        unsafe {
            if head > 0 {
                libc::munmap(p, head);
            }
            if tail > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, tail);
            }
        }
        aligned as *mut u8
    }

    fn notify_not_using(&self, p: *mut u8, size: usize) {
        debug_assert_eq!(p as usize % OS_PAGE_SIZE, 0);
        debug_assert_eq!(size % OS_PAGE_SIZE, 0);
        unsafe {
            libc::madvise(p as *mut libc::c_void, size, libc::MADV_DONTNEED);
        }
    }

    fn notify_using(&self, p: *mut u8, size: usize) {
        debug_assert_eq!(p as usize % OS_PAGE_SIZE, 0);
        unsafe {
            libc::madvise(p as *mut libc::c_void, size, libc::MADV_WILLNEED);
        }
    }
}
