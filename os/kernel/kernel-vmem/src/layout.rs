//! Where the kernel space puts things.

use kernel_info::memory::{
    DIRECT_MAP_BYTES, HHDM_BASE, KERNEL_BASE, KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL, KERNEL_HEAP_MAX,
    KERNEL_IMAGE_BYTES, MMIO_BASE, PHYS_LOAD,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// The loaded kernel image: where it sits physically and where it runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub physical: PhysicalAddress,
    pub virtual_base: VirtualAddress,
    pub len: u64,
}

/// Shape of the kernel half built by
/// [`VirtualMemoryManager::init`](crate::VirtualMemoryManager::init).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    /// Physical memory `[0, direct_map_bytes)` appears at `direct_map_base`.
    pub direct_map_base: VirtualAddress,
    pub direct_map_bytes: u64,
    pub kernel_image: KernelImage,
    pub heap_base: VirtualAddress,
    /// Mapped by the heap at setup.
    pub heap_initial: u64,
    /// The heap never grows past `heap_base + heap_max`.
    pub heap_max: u64,
    /// Map the VGA frame buffer and text buffer at `mmio_base`.
    pub map_vga: bool,
    pub mmio_base: VirtualAddress,
}

impl KernelLayout {
    pub const DEFAULT: Self = Self {
        direct_map_base: VirtualAddress::new(HHDM_BASE),
        direct_map_bytes: DIRECT_MAP_BYTES,
        kernel_image: KernelImage {
            physical: PhysicalAddress::new(PHYS_LOAD),
            virtual_base: VirtualAddress::new(KERNEL_BASE),
            len: KERNEL_IMAGE_BYTES,
        },
        heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
        heap_initial: KERNEL_HEAP_INITIAL,
        heap_max: KERNEL_HEAP_MAX,
        map_vga: true,
        mmio_base: VirtualAddress::new(MMIO_BASE),
    };

    /// Virtual address of physical `pa` through the direct map, if covered.
    #[must_use]
    pub const fn direct_map(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        if pa.as_u64() < self.direct_map_bytes {
            Some(VirtualAddress::new(self.direct_map_base.as_u64() + pa.as_u64()))
        } else {
            None
        }
    }

    /// One past the highest heap address.
    #[must_use]
    pub const fn heap_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.heap_base.as_u64() + self.heap_max)
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
