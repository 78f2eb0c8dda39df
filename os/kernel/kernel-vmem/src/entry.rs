//! Page-table entries as bitfields, and the flag set callers map with.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// One 64-bit entry of any of the four table levels.
///
/// This is the common superset of PML4E, PDPTE, PDE and PTE. Whether an
/// entry points at the next table or maps memory (a *leaf*) depends on the
/// level and on [`page_size`](Self::page_size).
///
/// | Bits   | Field            |
/// |--------|------------------|
/// | 0      | present          |
/// | 1      | writable         |
/// | 2      | user             |
/// | 3      | write-through    |
/// | 4      | cache disable    |
/// | 5      | accessed         |
/// | 6      | dirty (leaf)     |
/// | 7      | page size        |
/// | 8      | global (leaf)    |
/// | 9–11   | OS available     |
/// | 12–51  | frame address    |
/// | 52–58  | OS available     |
/// | 59–62  | protection key   |
/// | 63     | no-execute       |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Set by the CPU on any access.
    pub accessed: bool,
    /// Set by the CPU on the first write through a leaf.
    pub dirty: bool,
    /// In a PDPTE or PDE: this entry maps a 1 GiB or 2 MiB page.
    pub page_size: bool,
    /// Leaf survives CR3 reloads when CR4.PGE is on.
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    /// Physical address bits 51:12.
    #[bits(40)]
    frame_bits: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

/// Bits of an entry that hold the frame address.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    /// An entry mapping (or pointing at) `pa` with `flags`.
    #[inline]
    #[must_use]
    pub const fn with_frame(pa: PhysicalAddress, flags: PageFlags) -> Self {
        Self::from_bits((pa.as_u64() & ADDRESS_MASK) | (flags.bits() & !ADDRESS_MASK))
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    pub const fn set_frame(&mut self, pa: PhysicalAddress) {
        self.set_frame_bits(pa.as_u64() >> 12);
    }

    /// Everything but the address.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(self.into_bits() & !ADDRESS_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    /// Present with `PS` set, i.e. a 2 MiB or 1 GiB leaf above the PT level.
    #[inline]
    #[must_use]
    pub const fn is_huge(&self) -> bool {
        self.present() && self.page_size()
    }
}

bitflags::bitflags! {
    /// Flags of a mapping, at their hardware bit positions.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Reachable from CPL 3.
        const USER = 1 << 2;
        /// Write-through caching, used for frame buffers.
        const WRITE_THROUGH = 1 << 3;
        /// Uncached, used for device registers.
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// OS bit: the frame is not owned by the mapping.
        ///
        /// Unmapping or tearing down such a page leaves the frame alone, and
        /// cloning a space shares it instead of copying it. Set for the
        /// direct map, the kernel image and device memory.
        const BORROWED = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Kernel read/write data.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);

    /// User read/write data.
    pub const USER_RW: Self = Self::KERNEL_RW.union(Self::USER);

    /// Flags of an intermediate table pointing at the next level.
    #[inline]
    #[must_use]
    pub const fn table(user: bool) -> Self {
        if user { Self::USER_RW } else { Self::KERNEL_RW }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_the_hardware() {
        let e = PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_write_through(true)
            .with_cache_disable(true)
            .with_page_size(true)
            .with_global(true)
            .with_no_execute(true);
        assert_eq!(e.into_bits(), 0x8000_0000_0000_019F);
        assert_eq!(
            e.flags(),
            PageFlags::PRESENT
                | PageFlags::WRITABLE
                | PageFlags::USER
                | PageFlags::WRITE_THROUGH
                | PageFlags::CACHE_DISABLE
                | PageFlags::HUGE
                | PageFlags::GLOBAL
                | PageFlags::NO_EXECUTE
        );
    }

    #[test]
    fn frame_is_kept_apart_from_flags() {
        let pa = PhysicalAddress::new(0x0000_0012_3456_7000);
        let e = PageTableEntry::with_frame(pa, PageFlags::USER_RW | PageFlags::NO_EXECUTE);
        assert_eq!(e.frame(), pa);
        assert!(e.present() && e.writable() && e.user() && e.no_execute());
        assert!(!e.is_huge());

        let mut e = e;
        e.set_frame(PhysicalAddress::new(0x5000));
        assert_eq!(e.frame().as_u64(), 0x5000);
        assert_eq!(e.flags(), PageFlags::USER_RW | PageFlags::NO_EXECUTE);
    }

    #[test]
    fn os_bit_carries_borrowed() {
        let e = PageTableEntry::with_frame(PhysicalAddress::new(0xb8000), PageFlags::KERNEL_RW | PageFlags::BORROWED);
        assert_eq!(e.os_low(), 1);
        assert!(e.flags().contains(PageFlags::BORROWED));
        assert!(PageTableEntry::new().is_unused());
    }
}
