//! # Boot Wiring
//!
//! [`KernelMemory`] owns the one PMM and the one VMM of the running kernel
//! and refers to the heap installed as `#[global_allocator]`. It is meant to
//! live in a `static`:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: KernelHeap<VmmHeapBacking<'static, HhdmPhysMapper>> = KernelHeap::new();
//! static MEMORY: KernelMemory<HhdmPhysMapper, VmmHeapBacking<'static, HhdmPhysMapper>> =
//!     KernelMemory::new(&HEAP);
//!
//! let memory = unsafe {
//!     MEMORY.boot_or_halt(&map, KernelLayout::DEFAULT, HhdmPhysMapper::new(DIRECT_MAP_BYTES),
//!         PmmConfig::DEFAULT, VmmHeapBacking::new)
//! };
//! ```
//!
//! Code that can be handed its dependencies receives the [`KernelContext`];
//! interrupt handlers, which cannot, reach it through
//! [`KernelMemory::context`].

use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::MemoryMap;
use kernel_pmm::{PhysMapper, PhysicalMemoryManager, PmmConfig, PmmError};
use kernel_registers::cpu::halt_loop;
use kernel_sync::SyncOnceCell;
use kernel_vmem::{KernelLayout, VirtualMemoryManager, VmmError};
use log::{error, info};

use crate::backing::HeapBacking;
use crate::error::HeapError;
use crate::heap::KernelHeap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("memory was already booted")]
    AlreadyBooted,
    #[error("memory is not booted")]
    NotInitialized,
    #[error("physical memory: {0}")]
    Pmm(#[from] PmmError),
    #[error("virtual memory: {0}")]
    Vmm(#[from] VmmError),
    #[error("kernel heap: {0}")]
    Heap(#[from] HeapError),
}

/// The memory subsystem of a booted kernel, by reference.
pub struct KernelContext<'k, M: PhysMapper + 'static, B: 'static> {
    pub pmm: &'k PhysicalMemoryManager<M>,
    pub vmm: &'k VirtualMemoryManager<'static, M>,
    pub heap: &'k KernelHeap<B>,
}

impl<M: PhysMapper + 'static, B: 'static> Clone for KernelContext<'_, M, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper + 'static, B: 'static> Copy for KernelContext<'_, M, B> {}

/// Once-initialized PMM and VMM, plus the heap built on them.
pub struct KernelMemory<M: PhysMapper + 'static, B: 'static> {
    booting: AtomicBool,
    pmm: SyncOnceCell<PhysicalMemoryManager<M>>,
    vmm: SyncOnceCell<VirtualMemoryManager<'static, M>>,
    heap: &'static KernelHeap<B>,
}

impl<M, B> KernelMemory<M, B>
where
    M: PhysMapper + Send + Sync + 'static,
    B: HeapBacking + 'static,
{
    #[must_use]
    pub const fn new(heap: &'static KernelHeap<B>) -> Self {
        Self {
            booting: AtomicBool::new(false),
            pmm: SyncOnceCell::new(),
            vmm: SyncOnceCell::new(),
            heap,
        }
    }

    /// Seed the PMM from `map`, build the kernel space, and set up the heap
    /// over the backing `make_backing` returns.
    ///
    /// Only the first call does anything. A failed boot is not retried.
    ///
    /// # Errors
    /// [`BootError::AlreadyBooted`] on any later call, otherwise whatever
    /// step failed.
    ///
    /// # Safety
    /// The usable regions of `map` must be RAM that nothing else uses, and
    /// `mapper` must reach all of it.
    pub unsafe fn boot(
        &'static self,
        map: &MemoryMap<'_>,
        layout: KernelLayout,
        mapper: M,
        config: PmmConfig,
        make_backing: impl FnOnce(&'static VirtualMemoryManager<'static, M>) -> B,
    ) -> Result<KernelContext<'static, M, B>, BootError> {
        if self.booting.swap(true, Ordering::AcqRel) {
            return Err(BootError::AlreadyBooted);
        }

        let pmm = self
            .pmm
            .set(PhysicalMemoryManager::new(mapper, config))
            .map_err(|_| BootError::AlreadyBooted)?;
        let pages = unsafe { pmm.setup(map) }?;
        info!("boot: {pages} pages of physical memory seeded");

        let vmm = self
            .vmm
            .set(VirtualMemoryManager::init(pmm, layout)?)
            .map_err(|_| BootError::AlreadyBooted)?;
        self.heap.setup(make_backing(vmm))?;

        let stats = pmm.get_stats();
        info!(
            "boot: memory ready, {} of {} pages free",
            stats.free_pages, stats.total_pages
        );
        Ok(KernelContext {
            pmm,
            vmm,
            heap: self.heap,
        })
    }

    /// [`boot`](Self::boot), halting the core on failure.
    ///
    /// # Safety
    /// As for [`boot`](Self::boot).
    pub unsafe fn boot_or_halt(
        &'static self,
        map: &MemoryMap<'_>,
        layout: KernelLayout,
        mapper: M,
        config: PmmConfig,
        make_backing: impl FnOnce(&'static VirtualMemoryManager<'static, M>) -> B,
    ) -> KernelContext<'static, M, B> {
        match unsafe { self.boot(map, layout, mapper, config, make_backing) } {
            Ok(context) => context,
            Err(e) => {
                error!("boot: {e}, halting");
                halt_loop()
            }
        }
    }

    /// The context of a completed boot.
    ///
    /// # Errors
    /// [`BootError::NotInitialized`] until [`boot`](Self::boot) succeeded.
    pub fn context(&'static self) -> Result<KernelContext<'static, M, B>, BootError> {
        match (self.pmm.get(), self.vmm.get()) {
            (Some(pmm), Some(vmm)) if self.heap.is_initialized() => Ok(KernelContext {
                pmm,
                vmm,
                heap: self.heap,
            }),
            _ => Err(BootError::NotInitialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::HostHeapBacking;
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
    use kernel_pmm::HostRam;
    use kernel_vmem::{KernelImage, VmaFlags, VmaKind};

    type Memory = KernelMemory<HostRam, HostHeapBacking>;

    const LAYOUT: KernelLayout = KernelLayout {
        direct_map_bytes: 2 * 1024 * 1024,
        kernel_image: KernelImage {
            physical: PhysicalAddress::new(0x10_0000),
            virtual_base: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
            len: 0x2_0000,
        },
        heap_initial: 0x1_0000,
        heap_max: 0x10_0000,
        ..KernelLayout::DEFAULT
    };

    fn memory() -> &'static Memory {
        let heap = Box::leak(Box::new(KernelHeap::new()));
        Box::leak(Box::new(KernelMemory::new(heap)))
    }

    fn host_heap(vmm: &VirtualMemoryManager<'_, HostRam>) -> HostHeapBacking {
        let layout = vmm.layout();
        HostHeapBacking::new(layout.heap_initial as usize, layout.heap_max as usize)
    }

    #[test]
    fn boot_wires_everything_once() {
        let memory = memory();
        assert_eq!(memory.context().err(), Some(BootError::NotInitialized));

        let ram = HostRam::new(2 * 1024 * 1024);
        let regions = [ram.usable_region()];
        let config = PmmConfig { max_physical: u64::MAX };
        let ctx = unsafe { memory.boot(&MemoryMap::new(&regions), LAYOUT, ram, config, host_heap) }.unwrap();

        assert!(ctx.pmm.is_set_up());
        assert_eq!(ctx.heap.get_stats().unwrap().total_bytes, 0x1_0000);
        let space = ctx.vmm.create_address_space().unwrap();
        space
            .map_anonymous(
                VirtualAddress::new(0x1000),
                VirtualAddress::new(0x3000),
                VmaFlags::RW,
                VmaKind::Heap,
            )
            .unwrap();
        let block = ctx.heap.alloc(128, 16).unwrap();
        unsafe { ctx.heap.free(block) }.unwrap();

        let again = memory.context().unwrap();
        assert!(core::ptr::eq(again.pmm, ctx.pmm));
        assert!(core::ptr::eq(again.vmm, ctx.vmm));

        let ram = HostRam::new(64 * 1024);
        let regions = [ram.usable_region()];
        assert_eq!(
            unsafe { memory.boot(&MemoryMap::new(&regions), LAYOUT, ram, config, host_heap) }.err(),
            Some(BootError::AlreadyBooted)
        );
    }

    #[test]
    fn failed_boot_leaves_no_context() {
        let memory = memory();
        let ram = HostRam::new(64 * 1024);
        let regions = [ram.usable_region()];
        let layout = KernelLayout {
            direct_map_bytes: 64 * 1024 * 1024,
            ..LAYOUT
        };
        let config = PmmConfig { max_physical: u64::MAX };
        let err = unsafe { memory.boot(&MemoryMap::new(&regions), layout, ram, config, host_heap) }.err();
        assert_eq!(err, Some(BootError::Vmm(VmmError::OutOfMemory)));
        assert_eq!(memory.context().err(), Some(BootError::NotInitialized));
    }

    #[test]
    fn heap_errors_surface_through_boot() {
        let memory = memory();
        let ram = HostRam::new(1024 * 1024);
        let regions = [ram.usable_region()];
        let config = PmmConfig { max_physical: u64::MAX };
        let tiny = |_: &VirtualMemoryManager<'_, HostRam>| HostHeapBacking::new(0x1_0000, 0x1_0000).with_memory_limit(0);
        let err = unsafe { memory.boot(&MemoryMap::new(&regions), LAYOUT, ram, config, tiny) }.err();
        assert_eq!(err, Some(BootError::Heap(HeapError::OutOfMemory)));
    }
}
