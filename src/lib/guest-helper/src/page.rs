//! Page arithmetic over guest addresses.

pub use netbsd_api::limits::PAGE_SIZE;

pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Panics (in debug builds) on overflow past the end of the address space.
pub const fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_SIZE - 1)
}

pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

pub const fn round_down(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    val & !(align - 1)
}

pub const fn round_up(val: usize, align: usize) -> usize {
    round_down(val + align - 1, align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3008));
        assert_eq!(round_up(13, 8), 16);
        assert_eq!(round_down(31, 16), 16);
    }
}
