//! # Physical Memory Manager
//!
//! The façade the rest of the kernel allocates physical memory through. It
//! owns the buddy allocator, one slab cache per size class, and the mapper
//! used to reach frames.
//!
//! ## Lifecycle
//!
//! 1. [`PhysicalMemoryManager::new`] builds an empty manager.
//! 2. [`PhysicalMemoryManager::setup`] seeds it from the boot memory map,
//!    exactly once, before anything else allocates.
//! 3. [`PhysicalMemoryManager::reclaim`] may later add bootloader or ACPI
//!    memory whose contents are no longer needed.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::{MemoryMap, MemoryRegionKind};
use kernel_info::memory::DIRECT_MAP_BYTES;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use log::{debug, error, info, warn};

use crate::buddy::{BuddyAllocator, BuddyError, MAX_ORDER, order_for_pages};
use crate::size_class::{MAX_SLAB_OBJECT, SIZE_CLASSES, SLAB_ALIGN, class_index};
use crate::slab::{PageSource, SlabCache, SlabError, SlabStats};
use crate::PhysMapper;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("physical memory manager was already set up")]
    AlreadySetUp,
    #[error("physical memory manager is not set up")]
    NotInitialized,
    #[error("{0:?} memory cannot be reclaimed")]
    NotReclaimable(MemoryRegionKind),
    #[error(transparent)]
    Buddy(#[from] BuddyError),
    #[error(transparent)]
    Slab(#[from] SlabError),
}

/// Runtime configuration of the manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmmConfig {
    /// Frames at or above this address are never handed out.
    ///
    /// Must not exceed what the mapper can reach, since allocator metadata
    /// lives inside the frames.
    pub max_physical: u64,
}

impl PmmConfig {
    pub const DEFAULT: Self = Self {
        max_physical: DIRECT_MAP_BYTES,
    };
}

impl Default for PmmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Page counts reported by [`PhysicalMemoryManager::get_stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmmStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
}

/// Buddy allocator plus slab caches over one physical mapper.
pub struct PhysicalMemoryManager<M: PhysMapper> {
    mapper: M,
    config: PmmConfig,
    buddy: SpinLock<BuddyAllocator>,
    caches: [SpinLock<SlabCache>; SIZE_CLASSES.len()],
    seeded: AtomicBool,
}

/// Slab pages come from the buddy allocator as order-0 blocks.
struct BuddyPages<'a, M: PhysMapper> {
    buddy: &'a SpinLock<BuddyAllocator>,
    mapper: &'a M,
}

impl<M: PhysMapper> PageSource for BuddyPages<'_, M> {
    fn alloc_page(&self) -> Option<(PhysicalAddress, NonNull<u8>)> {
        let pa = self.buddy.lock_irq().alloc(self.mapper, 0)?;
        NonNull::new(self.mapper.phys_to_ptr(pa)).map(|p| (pa, p))
    }

    unsafe fn free_page(&self, page: PhysicalAddress) {
        if let Err(e) = self.buddy.lock_irq().free(self.mapper, page, 0) {
            error!("slab page {page} could not be returned: {e}");
        }
    }
}

impl<M: PhysMapper> PhysicalMemoryManager<M> {
    /// An empty manager; nothing can be allocated until [`setup`](Self::setup).
    pub fn new(mapper: M, config: PmmConfig) -> Self {
        let max_physical = config.max_physical.min(mapper.limit());
        if max_physical < config.max_physical {
            warn!(
                "pmm: mapper reaches only {max_physical:#x}, lowering limit from {:#x}",
                config.max_physical
            );
        }
        Self {
            mapper,
            config: PmmConfig { max_physical },
            buddy: SpinLock::new(BuddyAllocator::new()),
            caches: core::array::from_fn(|i| SpinLock::new(SlabCache::new(SIZE_CLASSES[i]))),
            seeded: AtomicBool::new(false),
        }
    }

    /// Seed the buddy allocator with every usable region of `map`.
    ///
    /// Regions are trimmed to whole pages and clipped to
    /// [`PmmConfig::max_physical`]. Returns the number of pages added.
    ///
    /// # Errors
    /// [`PmmError::AlreadySetUp`] on any call after the first.
    ///
    /// # Safety
    /// Every region `map` reports as usable must really be unused RAM.
    pub unsafe fn setup(&self, map: &MemoryMap<'_>) -> Result<usize, PmmError> {
        if self.seeded.swap(true, Ordering::AcqRel) {
            return Err(PmmError::AlreadySetUp);
        }
        let pages = unsafe { self.add_regions(map, MemoryRegionKind::Usable) };
        let total = self.buddy.lock_irq().total_pages();
        info!(
            "pmm: {pages} usable pages ({} KiB) below {:#x}",
            total * (PAGE_SIZE as usize / 1024),
            self.config.max_physical
        );
        if pages == 0 {
            warn!("pmm: memory map contains no usable memory");
        }
        Ok(pages)
    }

    /// Add regions of a reclaimable `kind` once their contents are consumed.
    ///
    /// # Errors
    /// [`PmmError::NotInitialized`] before `setup`, [`PmmError::NotReclaimable`]
    /// for kinds that must stay reserved.
    ///
    /// # Safety
    /// Nothing may still use memory of that kind.
    pub unsafe fn reclaim(&self, map: &MemoryMap<'_>, kind: MemoryRegionKind) -> Result<usize, PmmError> {
        if !self.seeded.load(Ordering::Acquire) {
            return Err(PmmError::NotInitialized);
        }
        if !kind.is_reclaimable() {
            return Err(PmmError::NotReclaimable(kind));
        }
        let pages = unsafe { self.add_regions(map, kind) };
        info!("pmm: reclaimed {pages} pages of {kind:?}");
        Ok(pages)
    }

    unsafe fn add_regions(&self, map: &MemoryMap<'_>, kind: MemoryRegionKind) -> usize {
        let limit = self.config.max_physical;
        let mut buddy = self.buddy.lock_irq();
        let mut pages = 0;
        for region in map.of_kind(kind) {
            let end = region.end().min(limit);
            if region.base >= end {
                debug!("pmm: skipping {:#x}+{:#x} above the limit", region.base, region.length);
                continue;
            }
            pages += unsafe { buddy.add_region(&self.mapper, region.base, end - region.base) };
        }
        pages
    }

    /// `count` physically contiguous pages, rounded up to a power of two.
    #[must_use]
    pub fn alloc_pages(&self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let order = order_for_pages(count);
        if order > MAX_ORDER {
            warn!("pmm: request for {count} pages exceeds the largest block");
            return None;
        }
        self.buddy.lock_irq().alloc(&self.mapper, order)
    }

    /// Return pages obtained from [`alloc_pages`](Self::alloc_pages) with the same `count`.
    ///
    /// # Errors
    /// Propagates the buddy allocator's validation errors.
    pub fn free_pages(&self, addr: PhysicalAddress, count: usize) -> Result<(), PmmError> {
        let order = order_for_pages(count.max(1));
        Ok(self.buddy.lock_irq().free(&self.mapper, addr, order)?)
    }

    /// One frame.
    #[must_use]
    pub fn alloc_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_pages(1).map(PhysicalPage::containing)
    }

    /// # Errors
    /// See [`free_pages`](Self::free_pages).
    pub fn free_frame(&self, frame: PhysicalPage<Size4K>) -> Result<(), PmmError> {
        self.free_pages(frame.base(), 1)
    }

    /// One frame filled with zeroes.
    #[must_use]
    pub fn alloc_zeroed_page(&self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.alloc_frame()?;
        // SAFETY: freshly allocated, covered by the mapper.
        unsafe { self.mapper.zero_frame(frame) };
        Some(frame)
    }

    /// Uninitialised storage for one `T` from the smallest fitting slab class.
    ///
    /// Types larger than the largest class or aligned above 16 bytes do not
    /// compile.
    #[must_use]
    pub fn slab_alloc<T>(&self) -> Option<NonNull<T>> {
        const {
            assert!(size_of::<T>() <= MAX_SLAB_OBJECT, "type too large for slab caches");
            assert!(align_of::<T>() <= SLAB_ALIGN, "type over-aligned for slab caches");
        }
        let class = class_index(size_of::<T>())?;
        let pages = self.pages();
        let obj = self.caches[class].lock_irq().alloc(&pages);
        if obj.is_none() {
            warn!("pmm: slab class {} exhausted", SIZE_CLASSES[class]);
        }
        obj.map(NonNull::cast)
    }

    /// Return storage from [`slab_alloc`](Self::slab_alloc). The value is not dropped.
    ///
    /// # Errors
    /// [`PmmError::Slab`] for double frees or pointers from another class.
    ///
    /// # Safety
    /// `ptr` must come from `slab_alloc::<T>` on this manager and must not be
    /// used afterwards.
    pub unsafe fn slab_free<T>(&self, ptr: NonNull<T>) -> Result<(), PmmError> {
        let class = class_index(size_of::<T>()).ok_or(SlabError::ForeignObject)?;
        unsafe { self.caches[class].lock_irq().free(ptr.cast())? };
        Ok(())
    }

    /// Move `value` into slab storage.
    ///
    /// # Errors
    /// Hands `value` back when the cache cannot grow.
    pub fn slab_new<T>(&self, value: T) -> Result<NonNull<T>, T> {
        match self.slab_alloc::<T>() {
            Some(p) => {
                unsafe { p.as_ptr().write(value) };
                Ok(p)
            }
            None => Err(value),
        }
    }

    /// Drop the value at `ptr` and free its storage.
    ///
    /// # Safety
    /// `ptr` must come from [`slab_new`](Self::slab_new) on this manager and
    /// must not be used afterwards.
    pub unsafe fn slab_drop<T>(&self, ptr: NonNull<T>) {
        unsafe {
            core::ptr::drop_in_place(ptr.as_ptr());
            if let Err(e) = self.slab_free(ptr) {
                error!("pmm: slab object {:p} could not be freed: {e}", ptr.as_ptr());
            }
        }
    }

    /// Give completely free slabs back to the buddy allocator.
    pub fn shrink_caches(&self) -> usize {
        let pages = self.pages();
        self.caches
            .iter()
            .map(|c| c.lock_irq().shrink(&pages))
            .sum()
    }

    #[must_use]
    pub fn get_stats(&self) -> PmmStats {
        let buddy = self.buddy.lock_irq();
        PmmStats {
            total_pages: buddy.total_pages(),
            free_pages: buddy.free_pages(),
            used_pages: buddy.total_pages().saturating_sub(buddy.free_pages()),
        }
    }

    /// Counters of the cache serving `object_size` bytes.
    #[must_use]
    pub fn slab_stats(&self, object_size: usize) -> Option<SlabStats> {
        class_index(object_size).map(|i| self.caches[i].lock_irq().stats())
    }

    /// Whether `[addr, addr + bytes)` is memory this manager hands out.
    #[must_use]
    pub fn manages(&self, addr: PhysicalAddress, bytes: u64) -> bool {
        self.buddy.lock_irq().manages(addr, bytes)
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmmConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn is_set_up(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    const fn pages(&self) -> BuddyPages<'_, M> {
        BuddyPages {
            buddy: &self.buddy,
            mapper: &self.mapper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostRam;
    use kernel_info::boot::MemoryRegion;
    use std::collections::HashSet;
    use std::vec::Vec;

    const MIB: usize = 1024 * 1024;

    fn pmm_over(ram: HostRam, regions: &[MemoryRegion]) -> PhysicalMemoryManager<HostRam> {
        let pmm = PhysicalMemoryManager::new(ram, PmmConfig { max_physical: u64::MAX });
        unsafe { pmm.setup(&MemoryMap::new(regions)).unwrap() };
        pmm
    }

    #[test]
    fn one_mebibyte_at_zero() {
        let ram = HostRam::new(MIB);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, MIB as u64, MemoryRegionKind::Usable)]);

        let a = pmm.alloc_pages(1).unwrap();
        assert!(a.as_u64() < MIB as u64);
        let b = pmm.alloc_pages(1).unwrap();
        assert!(b.as_u64() < MIB as u64);
        assert_ne!(a, b);

        pmm.free_pages(a, 1).unwrap();
        let c = pmm.alloc_pages(1).unwrap();
        assert_ne!(c, b, "handed out a page that is still in use");

        let s = pmm.get_stats();
        assert_eq!(s.total_pages, 256);
        assert_eq!(s.used_pages, 2);
        assert_eq!(s.free_pages + s.used_pages, s.total_pages);
    }

    #[test]
    fn merged_pages_cannot_be_freed_again() {
        let ram = HostRam::new(MIB);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, MIB as u64, MemoryRegionKind::Usable)]);
        let a = pmm.alloc_pages(1).unwrap();
        let b = pmm.alloc_pages(1).unwrap();
        pmm.free_pages(a, 1).unwrap();
        pmm.free_pages(b, 1).unwrap();

        assert_eq!(pmm.free_pages(b, 1), Err(PmmError::Buddy(BuddyError::DoubleFree(b))));
        let s = pmm.get_stats();
        assert_eq!((s.free_pages, s.used_pages), (s.total_pages, 0));
    }

    #[test]
    fn setup_runs_once_and_respects_the_map() {
        let ram = HostRam::new(2 * MIB);
        let regions = [
            MemoryRegion::new(0, 0x8_0000, MemoryRegionKind::Usable),
            MemoryRegion::new(0x8_0000, 0x8_0000, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 0x10_0000, MemoryRegionKind::BootloaderReclaim),
        ];
        let pmm = PhysicalMemoryManager::new(ram, PmmConfig::DEFAULT);
        let map = MemoryMap::new(&regions);
        assert_eq!(unsafe { pmm.setup(&map) }, Ok(128));
        assert_eq!(unsafe { pmm.setup(&map) }, Err(PmmError::AlreadySetUp));

        for _ in 0..128 {
            let p = pmm.alloc_pages(1).unwrap();
            assert!(p.as_u64() < 0x8_0000, "allocated outside usable memory");
        }
        assert!(pmm.alloc_pages(1).is_none());

        assert_eq!(
            unsafe { pmm.reclaim(&map, MemoryRegionKind::Reserved) },
            Err(PmmError::NotReclaimable(MemoryRegionKind::Reserved))
        );
        assert_eq!(unsafe { pmm.reclaim(&map, MemoryRegionKind::BootloaderReclaim) }, Ok(256));
        assert!(pmm.alloc_pages(1).unwrap().as_u64() >= 0x10_0000);
    }

    #[test]
    fn limit_clips_regions_and_mapper_bounds_limit() {
        let ram = HostRam::new(MIB);
        let pmm = PhysicalMemoryManager::new(ram, PmmConfig { max_physical: 0x4_0000 });
        let regions = [MemoryRegion::new(0, 16 * MIB as u64, MemoryRegionKind::Usable)];
        assert_eq!(unsafe { pmm.setup(&MemoryMap::new(&regions)) }, Ok(64));

        let small = HostRam::new(64 * 1024);
        let pmm = PhysicalMemoryManager::new(small, PmmConfig { max_physical: u64::MAX });
        assert_eq!(pmm.config().max_physical, 64 * 1024);
    }

    #[test]
    fn reclaim_before_setup_fails() {
        let pmm = PhysicalMemoryManager::new(HostRam::new(64 * 1024), PmmConfig::DEFAULT);
        let map = MemoryMap::new(&[]);
        assert_eq!(
            unsafe { pmm.reclaim(&map, MemoryRegionKind::AcpiReclaim) },
            Err(PmmError::NotInitialized)
        );
        assert!(pmm.alloc_pages(1).is_none());
    }

    #[test]
    fn multi_page_requests_round_up() {
        let ram = HostRam::new(MIB);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, MIB as u64, MemoryRegionKind::Usable)]);
        let p = pmm.alloc_pages(3).unwrap();
        assert_eq!(p.as_u64() % (4 * PAGE_SIZE), 0);
        assert_eq!(pmm.get_stats().used_pages, 4);
        pmm.free_pages(p, 3).unwrap();
        assert_eq!(pmm.get_stats().used_pages, 0);
        assert!(pmm.alloc_pages(0).is_none());
        assert!(pmm.alloc_pages(2048).is_none());
    }

    #[test]
    fn zeroed_page_is_zero() {
        let ram = HostRam::new(64 * 1024);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, 64 * 1024, MemoryRegionKind::Usable)]);
        let f = pmm.alloc_frame().unwrap();
        unsafe { core::ptr::write_bytes(pmm.mapper().phys_to_ptr(f.base()), 0xAA, 4096) };
        pmm.free_frame(f).unwrap();
        let z = pmm.alloc_zeroed_page().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(pmm.mapper().phys_to_ptr(z.base()), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[repr(C)]
    struct Node {
        a: u64,
        b: [u8; 40],
    }

    #[test]
    fn slab_objects_use_the_smallest_class() {
        let ram = HostRam::new(MIB);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, MIB as u64, MemoryRegionKind::Usable)]);

        let mut ptrs = Vec::new();
        let mut seen = HashSet::new();
        for i in 0..100u64 {
            let p = pmm.slab_new(Node { a: i, b: [i as u8; 40] }).ok().unwrap();
            assert!(seen.insert(p.as_ptr() as usize));
            ptrs.push(p);
        }
        let stats = pmm.slab_stats(size_of::<Node>()).unwrap();
        assert_eq!(stats.object_size, 64);
        assert_eq!(stats.objects_in_use, 100);
        for (i, p) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { p.as_ref().a }, i as u64);
        }

        let used_with_slabs = pmm.get_stats().used_pages;
        assert!(used_with_slabs > 0);
        for p in ptrs {
            unsafe { pmm.slab_drop(p) };
        }
        assert_eq!(pmm.slab_stats(64).unwrap().objects_in_use, 0);
        assert_eq!(pmm.shrink_caches(), used_with_slabs);
        assert_eq!(pmm.get_stats().used_pages, 0);
    }

    #[test]
    fn slab_double_free_is_reported() {
        let ram = HostRam::new(64 * 1024);
        let pmm = pmm_over(ram, &[MemoryRegion::new(0, 64 * 1024, MemoryRegionKind::Usable)]);
        let p = pmm.slab_alloc::<u64>().unwrap();
        unsafe {
            pmm.slab_free(p).unwrap();
            assert_eq!(pmm.slab_free(p), Err(PmmError::Slab(SlabError::DoubleFree)));
        }
    }
}
