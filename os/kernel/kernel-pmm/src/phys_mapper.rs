//! # Physical-to-Virtual Access
//!
//! Code that manipulates frames (page tables, allocator headers, fresh pages
//! that must be zeroed) can only dereference virtual addresses. A
//! [`PhysMapper`] answers "where can I see this frame right now?". The kernel
//! uses its direct map ([`HhdmPhysMapper`]); tests use [`HostRam`].

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, Size4K};

/// Converts physical addresses into pointers usable by the running code.
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` may be accessed.
    ///
    /// The pointer is only valid to dereference if `pa` is RAM covered by the
    /// mapper's window.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Largest physical address (exclusive) this mapper can reach.
    fn limit(&self) -> u64;

    /// View the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// `pa` must be covered by the mapper, correctly aligned for `T`, hold a
    /// valid `T`, and not be aliased mutably for the lifetime `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Fill one 4 KiB frame with zeroes.
    ///
    /// # Safety
    /// The frame must be owned by the caller.
    #[inline]
    unsafe fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(frame.base()), 0, PAGE_SIZE as usize) }
    }

    /// Copy the contents of one 4 KiB frame into another.
    ///
    /// # Safety
    /// Both frames must be covered by the mapper, `dst` must be owned by the
    /// caller, and the frames must differ.
    #[inline]
    unsafe fn copy_frame(&self, src: PhysicalPage<Size4K>, dst: PhysicalPage<Size4K>) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src.base()).cast_const(),
                self.phys_to_ptr(dst.base()),
                PAGE_SIZE as usize,
            );
        }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }

    #[inline]
    fn limit(&self) -> u64 {
        (**self).limit()
    }
}

/// [`PhysMapper`] for the kernel's direct map: `pa` lives at `HHDM_BASE + pa`.
///
/// Only the first `window` bytes of physical memory are mapped there.
#[derive(Copy, Clone, Debug)]
pub struct HhdmPhysMapper {
    window: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(window: u64) -> Self {
        Self { window }
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        debug_assert!(pa.as_u64() < self.window, "{pa} is outside the direct map");
        (HHDM_BASE + pa.as_u64()) as usize as *mut u8
    }

    #[inline]
    fn limit(&self) -> u64 {
        self.window
    }
}

#[cfg(any(test, feature = "host-ram"))]
pub use host::HostRam;

#[cfg(any(test, feature = "host-ram"))]
mod host {
    use super::PhysMapper;
    use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
    use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::ptr::NonNull;

    /// A zeroed, page-aligned host allocation posing as the physical range
    /// `[phys_base, phys_base + len)`.
    pub struct HostRam {
        mem: NonNull<u8>,
        phys_base: u64,
        layout: Layout,
    }

    // Safety: the range is plain memory; callers synchronize through the allocators' locks.
    unsafe impl Send for HostRam {}
    unsafe impl Sync for HostRam {}

    impl HostRam {
        /// Simulated RAM at physical address 0.
        #[must_use]
        pub fn new(bytes: usize) -> Self {
            Self::with_base(0, bytes)
        }

        /// # Panics
        /// If `phys_base` or `bytes` is not page aligned, or the host is out of memory.
        #[must_use]
        pub fn with_base(phys_base: u64, bytes: usize) -> Self {
            assert_eq!(phys_base % PAGE_SIZE, 0, "base must be page aligned");
            assert_eq!(bytes as u64 % PAGE_SIZE, 0, "size must be page aligned");
            let layout =
                Layout::from_size_align(bytes, PAGE_SIZE as usize).expect("valid layout");
            let mem = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation");
            Self {
                mem,
                phys_base,
                layout,
            }
        }

        #[must_use]
        pub const fn phys_base(&self) -> u64 {
            self.phys_base
        }

        #[must_use]
        pub const fn len(&self) -> usize {
            self.layout.size()
        }

        #[must_use]
        pub const fn is_empty(&self) -> bool {
            self.layout.size() == 0
        }

        /// The whole simulated range as one usable region.
        #[must_use]
        pub const fn usable_region(&self) -> MemoryRegion {
            MemoryRegion::new(self.phys_base, self.layout.size() as u64, MemoryRegionKind::Usable)
        }

        /// Physical address of a pointer previously handed out by this mapper.
        #[must_use]
        pub fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
            let off = ptr as usize - self.mem.as_ptr() as usize;
            assert!(off < self.len(), "pointer outside simulated RAM");
            PhysicalAddress::new(self.phys_base + off as u64)
        }
    }

    impl PhysMapper for HostRam {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let pa = pa.as_u64();
            assert!(
                pa >= self.phys_base && pa < self.limit(),
                "physical address {pa:#x} outside simulated RAM"
            );
            unsafe { self.mem.as_ptr().add((pa - self.phys_base) as usize) }
        }

        fn limit(&self) -> u64 {
            self.phys_base + self.layout.size() as u64
        }
    }

    impl Drop for HostRam {
        fn drop(&mut self) {
            unsafe { dealloc(self.mem.as_ptr(), self.layout) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhdm_adds_fixed_offset() {
        let m = HhdmPhysMapper::new(0x1000_0000);
        assert_eq!(
            m.phys_to_ptr(PhysicalAddress::new(0x0123_4000)) as usize as u64,
            HHDM_BASE + 0x0123_4000
        );
        assert_eq!(m.limit(), 0x1000_0000);
    }

    #[test]
    fn host_ram_maps_and_zeroes() {
        let ram = HostRam::with_base(0x10_0000, 4 * 4096);
        let frame = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x10_1000));
        unsafe {
            *ram.phys_to_mut::<u64>(frame.base()) = 0xDEAD_BEEF;
            assert_eq!(*ram.phys_to_mut::<u64>(frame.base()), 0xDEAD_BEEF);
            ram.zero_frame(frame);
            assert_eq!(*ram.phys_to_mut::<u64>(frame.base()), 0);
        }
        let p = ram.phys_to_ptr(PhysicalAddress::new(0x10_2008));
        assert_eq!(ram.ptr_to_phys(p), PhysicalAddress::new(0x10_2008));
    }

    #[test]
    #[should_panic(expected = "outside simulated RAM")]
    fn host_ram_rejects_foreign_addresses() {
        let ram = HostRam::new(4096);
        let _ = ram.phys_to_ptr(PhysicalAddress::new(0x2000));
    }
}
