//! # Boot Memory Map
//!
//! The physical memory map handed over by the boot collaborator. It is parsed
//! from the firmware tables before the memory core runs and is read-only from
//! then on.

/// Classification of a physical range as reported by the bootloader.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM, handed to the page allocator.
    Usable = 0,
    /// Firmware-owned or otherwise unavailable.
    Reserved = 1,
    /// ACPI tables; reclaimable once they have been parsed.
    AcpiReclaim = 2,
    /// ACPI non-volatile storage, must be preserved across sleep states.
    AcpiNvs = 3,
    /// Defective RAM.
    Bad = 4,
    /// Bootloader structures; reclaimable once the kernel is done with them.
    BootloaderReclaim = 5,
    /// The kernel image and loaded modules.
    KernelAndModules = 6,
    /// A linear framebuffer.
    Framebuffer = 7,
}

impl MemoryRegionKind {
    /// Kinds whose memory may be given to the allocator after boot.
    #[inline]
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::AcpiReclaim | Self::BootloaderReclaim)
    }
}

/// One contiguous physical range `[base, base + length)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Borrowed, ordered view of the boot memory map.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMap<'a> {
    regions: &'a [MemoryRegion],
}

impl<'a> MemoryMap<'a> {
    #[inline]
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion]) -> Self {
        Self { regions }
    }

    #[inline]
    #[must_use]
    pub const fn regions(&self) -> &'a [MemoryRegion] {
        self.regions
    }

    /// Regions of the given kind, in map order.
    pub fn of_kind(&self, kind: MemoryRegionKind) -> impl Iterator<Item = &'a MemoryRegion> {
        self.regions.iter().filter(move |r| r.kind == kind)
    }

    /// Total bytes reported as [`MemoryRegionKind::Usable`].
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.of_kind(MemoryRegionKind::Usable)
            .map(|r| r.length)
            .sum()
    }

    /// Highest exclusive end address of any region.
    #[must_use]
    pub fn highest_address(&self) -> u64 {
        self.regions.iter().map(MemoryRegion::end).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_by_kind() {
        let regions = [
            MemoryRegion::new(0, 0x9_F000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x9_F000, 0x6_1000, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 0x70_0000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x80_0000, 0x1000, MemoryRegionKind::AcpiReclaim),
        ];
        let map = MemoryMap::new(&regions);
        assert_eq!(map.of_kind(MemoryRegionKind::Usable).count(), 2);
        assert_eq!(map.usable_bytes(), 0x9_F000 + 0x70_0000);
        assert_eq!(map.highest_address(), 0x80_1000);
        assert!(MemoryRegionKind::AcpiReclaim.is_reclaimable());
        assert!(!MemoryRegionKind::AcpiNvs.is_reclaimable());
    }
}
