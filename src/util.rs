use std::{fmt, fmt::Write};

/// Round up to a multiple of `multiple` (which must be a power of two)
pub const fn roundto(num: usize, multiple: usize) -> usize {
    (num + multiple - 1) & !(multiple - 1)
}

/// Number of bits needed to represent `x` rounded up to a power of two,
/// i.e. the exponent `k` of the smallest `2^k >= x`. `x` must be nonzero.
pub const fn next_pow2_bits(x: usize) -> usize {
    usize::BITS as usize - (x - 1).leading_zeros() as usize
}

/// Smallest power of two `>= x`. `x` must be nonzero.
pub const fn next_pow2(x: usize) -> usize {
    1 << next_pow2_bits(x)
}

/// Wrapper to make pointers print as bare hex in tracing events
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);
impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(p: *const T) -> Self {
        Self(p as *const () as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(p: *mut T) -> Self {
        Self(p as *mut () as usize)
    }
}
pub unsafe fn _debug_hexdump(p: *const u8, mut sz: usize) -> Result<String, fmt::Error> {
    let mut s = String::new();
    let mut off = 0;

    while sz > 0 {
        write!(&mut s, "{:08X}: ", off)?;
        let chunk_sz = if sz >= 16 { 16 } else { sz };
        // hex
        for i in 0..chunk_sz {
            let c = *(p.add(off + i));
            write!(&mut s, "{:02X} ", c)?;
        }
        for _ in chunk_sz..16 {
            write!(&mut s, "   ")?;
        }
        // bar
        write!(&mut s, "| ")?;
        // ascii
        for i in 0..chunk_sz {
            let c = *(p.add(off + i));
            if c.is_ascii_graphic() {
                write!(&mut s, "{}", c as char)?;
            } else {
                write!(&mut s, ".")?;
            }
        }
        write!(&mut s, "\n")?;
        off += chunk_sz;
        sz -= chunk_sz;
    }

    Ok(s)
}
