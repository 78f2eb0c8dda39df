use core::fmt::Debug;

mod sealed {
    pub trait Sealed {}
}

/// Marker for the three x86-64 leaf sizes a page-table walk can end on.
pub trait PageSize: sealed::Sealed + Copy + Eq + Ord + Debug {
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Mask selecting the in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
        }
    };
}

page_size!(
    /// 4 KiB page, the base granularity of every allocator in the kernel.
    Size4K,
    12
);
page_size!(
    /// 2 MiB leaf (PD entry with `PS` set).
    Size2M,
    21
);
page_size!(
    /// 1 GiB leaf (PDPT entry with `PS` set).
    Size1G,
    30
);

/// Bytes in a base page.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Offset bits of a base page.
pub const PAGE_MASK: u64 = Size4K::MASK;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Number of base pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_shifts() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::SIZE, 2 * 1024 * 1024);
        assert_eq!(Size1G::SIZE, 1024 * 1024 * 1024);
        assert_eq!(Size2M::MASK, 0x1F_FFFF);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(8193), 3);
    }
}
