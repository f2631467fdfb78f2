/// mask with the lowest `bits` bits set.
#[inline]
pub const fn bit_range_lower(bits: u32) -> usize {
    if bits >= usize::BITS {
        usize::MAX
    } else {
        (1usize << bits).wrapping_sub(1)
    }
}

/// mask with `len` bits set, starting at bit `start`.
#[inline]
pub const fn bit_range(start: u32, len: u32) -> usize {
    bit_range_lower(len) << start
}

#[inline]
pub const fn extract(bin: usize, start: u32, len: u32) -> usize {
    (bin & bit_range(start, len)) >> start
}

/// `log2(v)` if `v` is a power of two.
#[inline]
pub const fn exact_log2(v: usize) -> Option<u32> {
    if v.is_power_of_two() {
        Some(v.trailing_zeros())
    } else {
        None
    }
}
