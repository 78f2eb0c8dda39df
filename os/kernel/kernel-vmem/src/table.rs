//! The 4 KiB table shared by all paging levels, and virtual-address indexing.

use crate::entry::PageTableEntry;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table.
pub const ENTRIES: usize = 512;

/// One paging structure: PML4, PDPT, PD or PT.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: usize) {
        self.entries[index] = PageTableEntry::new();
    }

    /// Whether no entry is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageTableEntry::is_unused)
    }

    /// Indices and entries of every present slot within `range`.
    pub fn present(&self, range: core::ops::Range<usize>) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries[range.clone()]
            .iter()
            .copied()
            .zip(range)
            .filter(|(e, _)| e.present())
            .map(|(e, i)| (i, e))
    }
}

/// Paging level, named after the table it indexes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, `None` for the PT.
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Index of `va` within a table of this level.
    #[inline]
    #[must_use]
    pub const fn index(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }
}

/// `(pml4, pdpt, pd, pt)` indices of `va`.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [usize; 4] {
    [
        Level::Pml4.index(va),
        Level::Pdpt.index(va),
        Level::Pd.index(va),
        Level::Pt.index(va),
    ]
}

/// The virtual address selected by a full set of indices (sign-extended).
#[inline]
#[must_use]
pub const fn join_indices(i: [usize; 4]) -> VirtualAddress {
    VirtualAddress::canonicalize(
        ((i[0] as u64) << 39) | ((i[1] as u64) << 30) | ((i[2] as u64) << 21) | ((i[3] as u64) << 12),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PageFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn indices_of_the_layout_anchors() {
        assert_eq!(split_indices(VirtualAddress::new(0xFFFF_FFFF_8000_0000)), [511, 510, 0, 0]);
        assert_eq!(split_indices(VirtualAddress::new(0xFFFF_8880_0000_0000)), [273, 0, 0, 0]);
        assert_eq!(split_indices(VirtualAddress::new(0x0000_0000_0040_3000)), [0, 0, 2, 3]);
    }

    #[test]
    fn join_inverts_split() {
        for va in [0x1000_u64, 0x7FFF_FFFF_F000, 0xFFFF_8000_0000_0000, 0xFFFF_FFFF_FFFF_F000] {
            let va = VirtualAddress::new(va);
            assert_eq!(join_indices(split_indices(va)), va);
        }
    }

    #[test]
    fn present_skips_empty_slots() {
        let mut t = PageTable {
            entries: [PageTableEntry::new(); ENTRIES],
        };
        assert!(t.is_empty());
        t.set(3, PageTableEntry::with_frame(PhysicalAddress::new(0x3000), PageFlags::KERNEL_RW));
        t.set(300, PageTableEntry::with_frame(PhysicalAddress::new(0x4000), PageFlags::KERNEL_RW));
        let found: [usize; 2] = {
            let mut it = t.present(0..ENTRIES).map(|(i, _)| i);
            [it.next().unwrap(), it.next().unwrap()]
        };
        assert_eq!(found, [3, 300]);
        assert_eq!(t.present(0..256).count(), 1);
        t.clear(3);
        t.clear(300);
        assert!(t.is_empty());
    }
}
