//! Compile-time configuration shared by every component.

/// log2 of the size of a superslab (the pagemap granularity)
pub const SUPERSLAB_BITS: usize = 24; // 16 M
/// Size in bytes of a superslab
pub const SUPERSLAB_SIZE: usize = 1 << SUPERSLAB_BITS;
/// log2 of the size of a slab within a superslab
pub const SLAB_BITS: usize = 16; // 64 K
/// Size in bytes of a slab within a superslab
pub const SLAB_SIZE: usize = 1 << SLAB_BITS;
/// The number of slabs that fit within a superslab (including the short slab)
pub const SLAB_COUNT: usize = SUPERSLAB_SIZE / SLAB_SIZE;
/// Size in bytes of an OS page
pub const OS_PAGE_SIZE: usize = 4096;
/// Usable virtual address bits; bounds the flat pagemap and the large classes
pub const ADDRESS_BITS: usize = 48;

const _: () = assert!(std::mem::size_of::<usize>() == 8);
const _: () = assert!(SLAB_BITS < SUPERSLAB_BITS);
const _: () = assert!(OS_PAGE_SIZE.is_power_of_two());

/// log2 of the number of buckets in the outgoing remote cache
pub const REMOTE_SLOT_BITS: usize = 6;
/// Number of buckets in the outgoing remote cache
pub const REMOTE_SLOTS: usize = 1 << REMOTE_SLOT_BITS;
/// Mask extracting a bucket index from an allocator id
pub const REMOTE_MASK: usize = REMOTE_SLOTS - 1;
/// Byte threshold at which the outgoing remote cache is posted
pub const REMOTE_CACHE: usize = 1 << 20;
/// Maximum number of mailbox messages drained per public entry
pub const REMOTE_BATCH: usize = 64;

/// Whether the returned memory must be zeroed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroMem {
    NoZero,
    YesZero,
}

/// Whether the allocation may expand the address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowReserve {
    NoReserve,
    YesReserve,
}

/// Policy for hinting freed memory back to the OS
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecommitStrategy {
    /// Never hint
    None,
    /// Hint the tails of empty superslabs and mediumslabs
    Super,
    /// Additionally hint the tails of freed large blocks
    All,
}

pub const DECOMMIT_STRATEGY: DecommitStrategy = DecommitStrategy::Super;

/// When true, `dealloc` validates that the pointer is the start of an object
pub const SAFE_CLIENT: bool = cfg!(feature = "safe-client");
