//! Where the heap's memory comes from.

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_pmm::PhysMapper;
use kernel_vmem::{PageFlags, SpaceRef, VirtualMemoryManager, VmmError};
use log::error;

use crate::error::HeapError;

/// A virtual window the heap grows into from the front.
///
/// # Safety
/// After [`map`](Self::map) succeeds, the range must be readable and
/// writable memory used by nothing but the heap, until the backing is
/// dropped.
pub unsafe trait HeapBacking {
    /// First byte of the window. Page aligned.
    fn base(&self) -> *mut u8;

    /// Bytes mapped by [`KernelHeap::setup`](crate::KernelHeap::setup).
    fn initial_len(&self) -> usize;

    /// Size of the whole window; the heap never grows beyond it.
    fn max_len(&self) -> usize;

    /// Back `[base + offset, base + offset + len)` with memory.
    ///
    /// Both values are page aligned and the range was never mapped before.
    /// On failure nothing of the range stays mapped.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if there is not enough memory.
    fn map(&mut self, offset: usize, len: usize) -> Result<(), HeapError>;
}

/// The heap window of [`KernelLayout`](kernel_vmem::KernelLayout), mapped in
/// the kernel space with fresh frames from the PMM.
pub struct VmmHeapBacking<'p, M: PhysMapper> {
    kernel: SpaceRef<'p, M>,
    base: VirtualAddress,
    initial: u64,
    max: u64,
}

impl<'p, M: PhysMapper> VmmHeapBacking<'p, M> {
    #[must_use]
    pub fn new(vmm: &VirtualMemoryManager<'p, M>) -> Self {
        let layout = vmm.layout();
        Self {
            kernel: vmm.get_kernel_address_space().clone(),
            base: layout.heap_base,
            initial: layout.heap_initial,
            max: layout.heap_max,
        }
    }
}

/// Flags of heap pages: kernel only, never executable, never flushed on a
/// space switch.
const HEAP_PAGE: PageFlags = PageFlags::KERNEL_RW
    .union(PageFlags::NO_EXECUTE)
    .union(PageFlags::GLOBAL);

unsafe impl<M: PhysMapper> HeapBacking for VmmHeapBacking<'_, M> {
    fn base(&self) -> *mut u8 {
        self.base.as_u64() as usize as *mut u8
    }

    fn initial_len(&self) -> usize {
        self.initial as usize
    }

    fn max_len(&self) -> usize {
        self.max as usize
    }

    fn map(&mut self, offset: usize, len: usize) -> Result<(), HeapError> {
        debug_assert_eq!((offset | len) as u64 % PAGE_SIZE, 0);
        let start = self.base + offset as u64;
        self.kernel
            .populate(start, start + len as u64, HEAP_PAGE)
            .map_err(|e| match e {
                VmmError::OutOfMemory => HeapError::OutOfMemory,
                e => {
                    error!("heap: mapping {start}+{len:#x} failed: {e}");
                    HeapError::InvalidLayout
                }
            })
    }
}

#[cfg(any(test, feature = "host-heap"))]
pub use host::HostHeapBacking;

#[cfg(any(test, feature = "host-heap"))]
mod host {
    use super::HeapBacking;
    use crate::error::HeapError;
    use kernel_memory_addresses::PAGE_SIZE;
    use std::alloc::{Layout, alloc, dealloc};
    use std::ptr::NonNull;

    /// A host allocation standing in for the heap window.
    ///
    /// The whole window is reserved up front; [`map`](HeapBacking::map)
    /// only checks the bounds and counts what was asked for.
    pub struct HostHeapBacking {
        mem: NonNull<u8>,
        layout: Layout,
        initial: usize,
        mapped: usize,
        /// Refuse to map beyond this many bytes.
        limit: usize,
    }

    // Safety: plain memory, only touched through the heap's lock.
    unsafe impl Send for HostHeapBacking {}

    impl HostHeapBacking {
        /// # Panics
        /// If the sizes are not page aligned or the host is out of memory.
        #[must_use]
        pub fn new(initial: usize, max: usize) -> Self {
            assert_eq!(initial % PAGE_SIZE as usize, 0, "initial size must be page aligned");
            assert_eq!(max % PAGE_SIZE as usize, 0, "maximum size must be page aligned");
            let layout = Layout::from_size_align(max, PAGE_SIZE as usize).expect("valid layout");
            let mem = NonNull::new(unsafe { alloc(layout) }).expect("host allocation");
            Self {
                mem,
                layout,
                initial,
                mapped: 0,
                limit: max,
            }
        }

        /// Pretend memory runs out once `bytes` of the window are mapped.
        #[must_use]
        pub const fn with_memory_limit(mut self, bytes: usize) -> Self {
            self.limit = bytes;
            self
        }
    }

    unsafe impl HeapBacking for HostHeapBacking {
        fn base(&self) -> *mut u8 {
            self.mem.as_ptr()
        }

        fn initial_len(&self) -> usize {
            self.initial
        }

        fn max_len(&self) -> usize {
            self.layout.size()
        }

        fn map(&mut self, offset: usize, len: usize) -> Result<(), HeapError> {
            assert_eq!(offset, self.mapped, "heap must grow at its end");
            if offset + len > self.limit {
                return Err(HeapError::OutOfMemory);
            }
            self.mapped += len;
            Ok(())
        }
    }

    impl Drop for HostHeapBacking {
        fn drop(&mut self) {
            unsafe { dealloc(self.mem.as_ptr(), self.layout) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryMap;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_pmm::{HostRam, PhysicalMemoryManager, PmmConfig};
    use kernel_vmem::{KernelImage, KernelLayout};

    const LAYOUT: KernelLayout = KernelLayout {
        direct_map_bytes: 1024 * 1024,
        kernel_image: KernelImage {
            physical: PhysicalAddress::new(0x10_0000),
            virtual_base: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
            len: 0x1_0000,
        },
        heap_initial: 0x4000,
        heap_max: 0x10_0000,
        ..KernelLayout::DEFAULT
    };

    fn pmm(bytes: usize) -> PhysicalMemoryManager<HostRam> {
        let ram = HostRam::new(bytes);
        let regions = [ram.usable_region()];
        let pmm = PhysicalMemoryManager::new(ram, PmmConfig { max_physical: u64::MAX });
        unsafe { pmm.setup(&MemoryMap::new(&regions)) }.unwrap();
        pmm
    }

    #[test]
    fn vmm_backing_maps_heap_pages_in_the_kernel_space() {
        let pmm = pmm(1024 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, LAYOUT).unwrap();
        let mut backing = VmmHeapBacking::new(&vmm);
        assert_eq!(backing.base() as usize as u64, LAYOUT.heap_base.as_u64());
        assert_eq!(backing.initial_len(), 0x4000);

        backing.map(0, 0x4000).unwrap();
        let kernel = vmm.get_kernel_address_space();
        let flags = kernel.page_flags(LAYOUT.heap_base + 0x3000).unwrap();
        assert!(flags.contains(HEAP_PAGE));
        assert!(!flags.contains(PageFlags::USER));
        assert!(kernel.get_physical_address(LAYOUT.heap_base + 0x4000).is_none());

        let user = vmm.create_address_space().unwrap();
        assert!(user.get_physical_address(LAYOUT.heap_base).is_some());
    }

    #[test]
    fn vmm_backing_reports_exhaustion_and_unwinds() {
        let pmm = pmm(256 * 1024);
        let vmm = VirtualMemoryManager::init(&pmm, KernelLayout { direct_map_bytes: 256 * 1024, ..LAYOUT }).unwrap();
        let mut backing = VmmHeapBacking::new(&vmm);
        let free_before = pmm.get_stats().free_pages;
        assert_eq!(backing.map(0, 0x10_0000), Err(HeapError::OutOfMemory));
        assert!(vmm.get_kernel_address_space().get_physical_address(LAYOUT.heap_base).is_none());
        pmm.shrink_caches();
        assert_eq!(pmm.get_stats().free_pages, free_before);
    }

    #[test]
    fn host_backing_enforces_its_limit() {
        let mut backing = HostHeapBacking::new(0x1000, 0x4000).with_memory_limit(0x2000);
        backing.map(0, 0x1000).unwrap();
        assert_eq!(backing.map(0x1000, 0x2000), Err(HeapError::OutOfMemory));
        backing.map(0x1000, 0x1000).unwrap();
    }
}
