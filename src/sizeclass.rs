//! Size-class table.
//!
//! Sizes are binned by an exponent/mantissa encoding: each class represents
//! a size of the form `m << e` with `INTERMEDIATE_BITS` mantissa bits over a
//! `MIN_ALLOC_BITS` granule. Classes below [NUM_SMALL_CLASSES] fit in slab
//! cells, classes below [NUM_SIZECLASSES] fit in mediumslab cells, and
//! everything above is sized as a power of two by the large path.

use crate::config::{ADDRESS_BITS, OS_PAGE_SIZE, SLAB_SIZE, SUPERSLAB_BITS, SUPERSLAB_SIZE};

/// Mantissa bits of the size-class encoding (1/4 steps between powers of two)
pub const INTERMEDIATE_BITS: usize = 2;
/// log2 of the smallest allocation granule
pub const MIN_ALLOC_BITS: usize = 4;
/// The smallest allocation size; must hold a freed-object header
pub const MIN_ALLOC_SIZE: usize = 1 << MIN_ALLOC_BITS;

/// Map a size onto its class index; usable in const position.
///
/// Returns [NUM_SIZECLASSES] or above for sizes the table does not cover
/// (the large path).
pub const fn size_to_sizeclass_const(size: usize) -> u8 {
    let leading_bit = 1usize << (INTERMEDIATE_BITS + MIN_ALLOC_BITS - 1);
    let mantissa_mask = (1usize << INTERMEDIATE_BITS) - 1;

    // Sizes in [0, MIN_ALLOC_SIZE] all land in class 0.
    let value = size.saturating_sub(1);
    let e = usize::BITS as usize
        - INTERMEDIATE_BITS
        - MIN_ALLOC_BITS
        - (value | leading_bit).leading_zeros() as usize;
    let b = if e == 0 { 0 } else { 1 };
    let m = (value >> (MIN_ALLOC_BITS + e - b)) & mantissa_mask;
    ((e << INTERMEDIATE_BITS) + m) as u8
}

/// Runtime form of [size_to_sizeclass_const]
#[inline]
pub fn size_to_sizeclass(size: usize) -> u8 {
    size_to_sizeclass_const(size)
}

/// Representative (rounded-up) byte size of a class; inverse of
/// [size_to_sizeclass] up to rounding
pub const fn sizeclass_to_size(sizeclass: u8) -> usize {
    let mantissa_mask = (1usize << INTERMEDIATE_BITS) - 1;

    let m_e = sizeclass as usize + 1;
    let m = m_e & mantissa_mask;
    let e = m_e >> INTERMEDIATE_BITS;
    let b = if e == 0 { 0 } else { 1 };
    let extended_m = m + (b << INTERMEDIATE_BITS);
    extended_m << ((e - b) + MIN_ALLOC_BITS)
}

/// Greatest multiple of `rsize` that is `<= offset`; used to recover a cell
/// boundary from an interior offset
#[inline]
pub const fn round_by_sizeclass(rsize: usize, offset: usize) -> usize {
    (offset / rsize) * rsize
}

#[inline]
pub const fn is_multiple_of_sizeclass(rsize: usize, offset: usize) -> bool {
    offset % rsize == 0
}

/// Classes whose objects fit in slab cells
pub const NUM_SMALL_CLASSES: usize = size_to_sizeclass_const(SLAB_SIZE) as usize;
/// Total table size; small classes plus mediumslab classes
pub const NUM_SIZECLASSES: usize = size_to_sizeclass_const(SUPERSLAB_SIZE) as usize;
pub const NUM_MEDIUM_CLASSES: usize = NUM_SIZECLASSES - NUM_SMALL_CLASSES;
/// Power-of-two classes of the large path: `2^(SUPERSLAB_BITS + c)`
pub const NUM_LARGE_CLASSES: usize = ADDRESS_BITS - SUPERSLAB_BITS;

// The class index must fit the one-byte field of the freed-object header.
const _: () = assert!(NUM_SIZECLASSES <= u8::MAX as usize);
const _: () = assert!(sizeclass_to_size(0) == MIN_ALLOC_SIZE);
const _: () = assert!(sizeclass_to_size(NUM_SMALL_CLASSES as u8) == SLAB_SIZE);
const _: () = assert!(sizeclass_to_size(NUM_SIZECLASSES as u8) == SUPERSLAB_SIZE);
// Every medium class size is a whole number of OS pages.
const _: () = {
    let mut c = NUM_SMALL_CLASSES;
    while c < NUM_SIZECLASSES {
        assert!(sizeclass_to_size(c as u8) % OS_PAGE_SIZE == 0);
        c += 1;
    }
};
