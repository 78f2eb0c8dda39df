//! # Virtual Memory Manager
//!
//! Builds the kernel space at boot, hands out user spaces sharing its kernel
//! half, and tracks which space is loaded in CR3.
//!
//! ## Kernel space
//!
//! ```text
//!   direct_map_base  ──  physical [0, direct_map_bytes)      RW NX G
//!                        minus the VGA frames when mapped below
//!   kernel_image     ──  physical load address, image length RW G
//!   mmio_base        ──  VGA frame buffer 0xA0000..0xC0000   RW NX G WT
//!   heap_base        ──  PDPT slots reserved, mapped by the heap later
//! ```
//!
//! All of these are `BORROWED`: the frames are not the space's to free.
//! Device registers reached through port I/O are never mapped.

use kernel_info::memory::{VGA_FRAMEBUFFER_BYTES, VGA_FRAMEBUFFER_PHYS};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::{PhysMapper, PhysicalMemoryManager};
use kernel_registers::{Cr3, StoreRegisterUnsafe};
use kernel_sync::SpinLock;
use log::{debug, error, info};

use crate::address_space::{AddressSpace, KERNEL_SLOTS, SpaceRef};
use crate::entry::PageFlags;
use crate::error::VmmError;
use crate::layout::KernelLayout;
use crate::table::Level;

/// The kernel space plus the currently loaded space.
pub struct VirtualMemoryManager<'p, M: PhysMapper> {
    pmm: &'p PhysicalMemoryManager<M>,
    layout: KernelLayout,
    kernel: SpaceRef<'p, M>,
    current: SpinLock<SpaceRef<'p, M>>,
}

impl<'p, M: PhysMapper> VirtualMemoryManager<'p, M> {
    /// Build the kernel space described by `layout` and switch to it.
    ///
    /// Any failure leaves nothing allocated. During boot such a failure is
    /// fatal: a kernel that cannot map itself cannot continue.
    ///
    /// # Errors
    /// [`VmmError::NotInitialized`] if `pmm` is not set up,
    /// [`VmmError::InvalidRange`] if a window of `layout` is not in the
    /// kernel half, [`VmmError::OutOfMemory`] if tables cannot be allocated.
    pub fn init(pmm: &'p PhysicalMemoryManager<M>, layout: KernelLayout) -> Result<Self, VmmError> {
        let kernel = AddressSpace::new_kernel(pmm)?;
        for slot in kernel_slots(&layout)? {
            kernel.reserve_kernel_slot(slot)?;
        }

        let fixed = PageFlags::KERNEL_RW | PageFlags::GLOBAL | PageFlags::BORROWED;
        for (start, end) in direct_map_pieces(&layout) {
            kernel
                .map_range(
                    layout.direct_map_base + start,
                    PhysicalAddress::new(start),
                    end - start,
                    fixed | PageFlags::NO_EXECUTE,
                )
                .inspect_err(|e| error!("vmm: direct map: {e}"))?;
        }

        let image = layout.kernel_image;
        kernel
            .map_range(image.virtual_base, image.physical, image.len, fixed)
            .inspect_err(|e| error!("vmm: kernel image: {e}"))?;

        if layout.map_vga {
            kernel
                .map_range(
                    layout.mmio_base,
                    PhysicalAddress::new(VGA_FRAMEBUFFER_PHYS),
                    VGA_FRAMEBUFFER_BYTES,
                    fixed | PageFlags::WRITE_THROUGH | PageFlags::NO_EXECUTE,
                )
                .inspect_err(|e| error!("vmm: VGA window: {e}"))?;
        }

        unsafe { Cr3::for_root(kernel.root()).store_unsafe() };
        info!(
            "vmm: kernel space at {}, {} MiB direct map, image {:#x} bytes at {}",
            kernel.root().base(),
            layout.direct_map_bytes >> 20,
            image.len,
            image.virtual_base
        );

        Ok(Self {
            pmm,
            layout,
            current: SpinLock::new(kernel.clone()),
            kernel,
        })
    }

    /// A fresh space whose kernel half is the kernel space's.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`].
    pub fn create_address_space(&self) -> Result<SpaceRef<'p, M>, VmmError> {
        AddressSpace::new_user(&self.kernel)
    }

    /// Load `space` into CR3 and make it current.
    ///
    /// The previously current space is released after the switch; if that
    /// was its last handle it is destroyed.
    pub fn switch_address_space(&self, space: &SpaceRef<'p, M>) {
        let mut current = self.current.lock_irq();
        if current.ptr_eq(space) {
            return;
        }
        unsafe { Cr3::for_root(space.root()).store_unsafe() };
        let previous = core::mem::replace(&mut *current, space.clone());
        drop(current);
        debug!("vmm: switched to {}", space.root().base());
        drop(previous);
    }

    #[inline]
    #[must_use]
    pub const fn get_kernel_address_space(&self) -> &SpaceRef<'p, M> {
        &self.kernel
    }

    #[must_use]
    pub fn current_address_space(&self) -> SpaceRef<'p, M> {
        self.current.lock_irq().clone()
    }

    /// The current space, unless its lock is held.
    pub(crate) fn try_current_address_space(&self) -> Option<SpaceRef<'p, M>> {
        self.current.try_lock().map(|c| c.clone())
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &'p PhysicalMemoryManager<M> {
        self.pmm
    }
}

/// Physical ranges covered by the direct map.
///
/// The VGA frames are left out when they get their own write-through
/// window, so no frame is mapped with two memory types.
fn direct_map_pieces(layout: &KernelLayout) -> impl Iterator<Item = (u64, u64)> {
    let bytes = layout.direct_map_bytes;
    let (hole_start, hole_end) = if layout.map_vga {
        (
            VGA_FRAMEBUFFER_PHYS.min(bytes),
            (VGA_FRAMEBUFFER_PHYS + VGA_FRAMEBUFFER_BYTES).min(bytes),
        )
    } else {
        (bytes, bytes)
    };
    [(0, hole_start), (hole_end, bytes)]
        .into_iter()
        .filter(|(start, end)| start < end)
}

/// PML4 slots touched by any kernel window of `layout`.
fn kernel_slots(layout: &KernelLayout) -> Result<impl Iterator<Item = usize>, VmmError> {
    let windows = [
        (layout.direct_map_base, layout.direct_map_bytes),
        (layout.kernel_image.virtual_base, layout.kernel_image.len),
        (layout.heap_base, layout.heap_max),
        (layout.mmio_base, if layout.map_vga { VGA_FRAMEBUFFER_BYTES } else { 0 }),
    ];
    let mut slots = [0..0, 0..0, 0..0, 0..0];
    for ((start, len), slot) in windows.into_iter().zip(&mut slots) {
        if len == 0 {
            continue;
        }
        let last = start
            .checked_add(len - 1)
            .filter(|l| start.is_kernel_half() && l.is_kernel_half())
            .ok_or(VmmError::InvalidRange {
                start,
                end: VirtualAddress::new(start.as_u64().wrapping_add(len)),
            })?;
        *slot = Level::Pml4.index(start)..Level::Pml4.index(last) + 1;
        debug_assert!(KERNEL_SLOTS.contains(&slot.start));
    }
    Ok(slots.into_iter().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelImage;
    use crate::test_support::pmm;
    use kernel_memory_addresses::PAGE_SIZE;

    const LAYOUT: KernelLayout = KernelLayout {
        direct_map_bytes: 2 * 1024 * 1024,
        kernel_image: KernelImage {
            physical: PhysicalAddress::new(0x10_0000),
            virtual_base: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
            len: 0x4_0000,
        },
        heap_initial: 0x1_0000,
        heap_max: 0x10_0000,
        ..KernelLayout::DEFAULT
    };

    #[test]
    fn kernel_space_has_the_fixed_windows() {
        let pmm = pmm(1024 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, LAYOUT).unwrap();
        let k = vmm.get_kernel_address_space();

        let hhdm = LAYOUT.direct_map(PhysicalAddress::new(0x1_2345)).unwrap();
        assert_eq!(k.get_physical_address(hhdm), Some(PhysicalAddress::new(0x1_2345)));
        let last = LAYOUT.direct_map_base + (LAYOUT.direct_map_bytes - 1);
        assert!(k.get_physical_address(last).is_some());
        assert!(k.get_physical_address(last + 1).is_none());

        let img = k.page_flags(LAYOUT.kernel_image.virtual_base + 0x3_F000).unwrap();
        assert!(img.contains(PageFlags::GLOBAL | PageFlags::WRITABLE));
        assert!(!img.contains(PageFlags::NO_EXECUTE));
        assert_eq!(
            k.get_physical_address(LAYOUT.kernel_image.virtual_base),
            Some(LAYOUT.kernel_image.physical)
        );

        let vga = k.translate(LAYOUT.mmio_base + 0x1_8000).unwrap();
        assert_eq!(vga.0.as_u64(), 0xb8000);
        assert!(vga.1.contains(PageFlags::WRITE_THROUGH));
        assert!(!vga.1.contains(PageFlags::CACHE_DISABLE));

        assert!(k.get_physical_address(LAYOUT.heap_base).is_none());
        assert!(vmm.current_address_space().ptr_eq(k));
    }

    #[test]
    fn vga_frames_are_only_reachable_write_through() {
        let pmm = pmm(1024 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, LAYOUT).unwrap();
        let k = vmm.get_kernel_address_space();
        let direct = |pa: u64| LAYOUT.direct_map_base + pa;

        assert!(k.get_physical_address(direct(0x9_F000)).is_some());
        assert!(k.get_physical_address(direct(0xA_0000)).is_none());
        assert!(k.get_physical_address(direct(0xB_8000)).is_none());
        assert!(k.get_physical_address(direct(0xB_F000)).is_none());
        assert_eq!(
            k.get_physical_address(direct(0xC_0000)),
            Some(PhysicalAddress::new(0xC_0000))
        );

        let without_vga = KernelLayout { map_vga: false, ..LAYOUT };
        assert_eq!(direct_map_pieces(&without_vga).collect::<Vec<_>>(), [(0, LAYOUT.direct_map_bytes)]);
        let tiny = KernelLayout {
            direct_map_bytes: 0x8_0000,
            ..LAYOUT
        };
        assert_eq!(direct_map_pieces(&tiny).collect::<Vec<_>>(), [(0, 0x8_0000)]);
    }

    #[test]
    fn heap_mappings_reach_spaces_created_earlier() {
        let pmm = pmm(1024 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, LAYOUT).unwrap();
        let user = vmm.create_address_space().unwrap();
        let k = vmm.get_kernel_address_space();
        k.populate(LAYOUT.heap_base, LAYOUT.heap_base + 2 * PAGE_SIZE, PageFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(
            user.get_physical_address(LAYOUT.heap_base + PAGE_SIZE),
            k.get_physical_address(LAYOUT.heap_base + PAGE_SIZE)
        );
        assert!(user.get_physical_address(LAYOUT.heap_base).is_some());
    }

    #[test]
    fn switching_keeps_the_current_space_alive() {
        let pmm = pmm(1024 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, LAYOUT).unwrap();
        let free_before = pmm.get_stats().free_pages;

        let space = vmm.create_address_space().unwrap();
        vmm.switch_address_space(&space);
        vmm.switch_address_space(&space);
        assert_eq!(space.ref_count(), 2);
        drop(space);
        assert!(!vmm.current_address_space().is_kernel());

        vmm.switch_address_space(&vmm.get_kernel_address_space().clone());
        pmm.shrink_caches();
        assert_eq!(pmm.get_stats().free_pages, free_before);
    }

    #[test]
    fn windows_outside_the_kernel_half_are_refused() {
        let pmm = pmm(256 * 1024);
        let layout = KernelLayout {
            direct_map_base: VirtualAddress::new(0x1000),
            ..LAYOUT
        };
        assert!(matches!(
            VirtualMemoryManager::init(&pmm, layout),
            Err(VmmError::InvalidRange { .. })
        ));
        pmm.shrink_caches();
        assert_eq!(pmm.get_stats().used_pages, 0);
    }

    #[test]
    fn failed_init_frees_everything() {
        let pmm = pmm(64 * 1024);
        let layout = KernelLayout {
            direct_map_bytes: 64 * 1024 * 1024,
            ..LAYOUT
        };
        assert_eq!(
            VirtualMemoryManager::init(&pmm, layout).err(),
            Some(VmmError::OutOfMemory)
        );
        pmm.shrink_caches();
        assert_eq!(pmm.get_stats().used_pages, 0);
    }
}
