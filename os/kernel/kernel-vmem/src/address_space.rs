//! # Address Spaces
//!
//! One PML4-rooted translation tree plus the areas describing it. Every user
//! space shares the kernel half (PML4 slots 256..512) with the kernel space;
//! the user half (slots 0..256) is private.
//!
//! ## Ownership
//!
//! - Spaces live in slab storage and are handled through [`SpaceRef`], a
//!   reference-counted pointer. Dropping the last one destroys the space.
//! - Leaf frames belong to the space unless mapped [`PageFlags::BORROWED`].
//!   Unmapping or destroying frees owned frames back to the PMM.
//! - Intermediate tables belong to the space and are freed as soon as they
//!   are empty. PDPTs of the kernel half belong to the kernel space.
//!
//! ## Locking
//!
//! The area list sits behind a reader/writer spinlock, the tables behind a
//! spinlock. Operations touching both take the area lock first.
//!
//! ## TLB
//!
//! Unmapping issues `invlpg`, which only affects the active space. Mappings
//! are only ever added to absent entries, which needs no invalidation.

mod tables;

use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering, fence};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_up};
use kernel_pmm::{PhysMapper, PhysicalMemoryManager};
use kernel_registers::tlb;
use kernel_sync::{RwSpinLock, SpinLock};
use log::{debug, error};

pub(crate) use self::tables::KERNEL_SLOTS;
use self::tables::{Tables, USER_SLOTS, release_leaf};
use crate::entry::PageFlags;
use crate::error::VmmError;
use crate::vma::{Vma, VmaFlags, VmaKind, VmaList, check_range};

/// A translation tree and its areas.
pub struct AddressSpace<'p, M: PhysMapper> {
    pmm: &'p PhysicalMemoryManager<M>,
    root: PhysicalPage<Size4K>,
    tables: SpinLock<Tables>,
    vmas: RwSpinLock<VmaList>,
    refs: AtomicUsize,
    /// The space whose kernel half this one borrows. `None` for the kernel
    /// space itself, which owns that half.
    kernel: Option<SpaceRef<'p, M>>,
}

impl<'p, M: PhysMapper> AddressSpace<'p, M> {
    /// A space with nothing mapped. Its kernel half becomes the one shared
    /// by every space later created from it.
    pub(crate) fn new_kernel(pmm: &'p PhysicalMemoryManager<M>) -> Result<SpaceRef<'p, M>, VmmError> {
        if !pmm.is_set_up() {
            return Err(VmmError::NotInitialized);
        }
        let root = pmm.alloc_zeroed_page().ok_or(VmmError::OutOfMemory)?;
        Self::publish(pmm, Tables::new(root), root, None)
    }

    /// An empty user half over the kernel half of `kernel`.
    pub(crate) fn new_user(kernel: &SpaceRef<'p, M>) -> Result<SpaceRef<'p, M>, VmmError> {
        let pmm = kernel.pmm;
        let root = pmm.alloc_zeroed_page().ok_or(VmmError::OutOfMemory)?;
        let mut tables = Tables::new(root);
        tables.share_kernel_half(pmm, &mut kernel.tables.lock_irq());
        Self::publish(pmm, tables, root, Some(kernel.clone()))
    }

    fn publish(
        pmm: &'p PhysicalMemoryManager<M>,
        tables: Tables,
        root: PhysicalPage<Size4K>,
        kernel: Option<SpaceRef<'p, M>>,
    ) -> Result<SpaceRef<'p, M>, VmmError> {
        let space = Self {
            pmm,
            root,
            tables: SpinLock::new(tables),
            vmas: RwSpinLock::new(VmaList::new()),
            refs: AtomicUsize::new(1),
            kernel,
        };
        match pmm.slab_new(space) {
            Ok(ptr) => {
                debug!("address space created, root {}", root.base());
                Ok(SpaceRef { ptr })
            }
            Err(space) => {
                drop(space);
                if let Err(e) = pmm.free_frame(root) {
                    error!("PML4 {} could not be freed: {e}", root.base());
                }
                Err(VmmError::OutOfMemory)
            }
        }
    }

    /// Physical frame of the PML4, as loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &'p PhysicalMemoryManager<M> {
        self.pmm
    }

    /// Whether this is the space owning the kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel.is_none()
    }

    /// Map the 4 KiB page at `va` to `pa`.
    ///
    /// Missing intermediate tables are created zeroed, present and writable,
    /// and user-accessible in the user half. Leaf flags are exactly `flags`
    /// plus `PRESENT`; nothing else is added implicitly.
    ///
    /// If `va` is already mapped nothing changes: mapping is idempotent, not
    /// an overwrite.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] when a table cannot be allocated,
    /// [`VmmError::InvalidRange`] for unaligned or non-canonical addresses.
    pub fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) -> Result<(), VmmError> {
        check_page(va, pa)?;
        self.tables.lock_irq().map(self.pmm, va, pa, flags).map(|_| ())
    }

    /// Remove the mapping at `va`, free its frame unless borrowed, and
    /// invalidate the TLB entry. Does nothing if `va` is not mapped.
    pub fn unmap_page(&self, va: VirtualAddress) {
        let va = va.align_down::<Size4K>();
        let old = self.tables.lock_irq().unmap(self.pmm, va);
        if let Some(entry) = old {
            unsafe { tlb::invlpg(va) };
            release_leaf(self.pmm, entry);
        }
    }

    /// Translate `va`, including through 2 MiB and 1 GiB leaves.
    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(va).map(|(pa, _)| pa)
    }

    /// Flags of the leaf translating `va`.
    #[must_use]
    pub fn page_flags(&self, va: VirtualAddress) -> Option<PageFlags> {
        self.translate(va).map(|(_, f)| f)
    }

    /// Physical address and leaf flags for `va`.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        self.tables.lock_irq().leaf(self.pmm, va)
    }

    /// [`translate`](Self::translate) unless the tables are locked; the
    /// outer `None` means they were.
    pub(crate) fn try_translate(&self, va: VirtualAddress) -> Option<Option<(PhysicalAddress, PageFlags)>> {
        self.tables.try_lock().map(|mut t| t.leaf(self.pmm, va))
    }

    /// [`find_vma`](Self::find_vma) unless the area list is write-locked.
    pub(crate) fn try_find_vma(&self, va: VirtualAddress) -> Option<Option<Vma>> {
        self.vmas.try_read().map(|v| v.find(va).copied())
    }

    /// Map `len` bytes of physically contiguous memory at `pa` to `va`.
    ///
    /// The frames stay the caller's business: unmapping frees them unless
    /// `flags` contains [`PageFlags::BORROWED`]. On failure nothing of the
    /// range stays mapped.
    ///
    /// # Errors
    /// [`VmmError::Overlap`] if a page of the range is already mapped,
    /// otherwise as [`map_page`](Self::map_page).
    pub fn map_range(&self, va: VirtualAddress, pa: PhysicalAddress, len: u64, flags: PageFlags) -> Result<(), VmmError> {
        check_page(va, pa)?;
        let end = va
            .checked_add(align_up(len, PAGE_SIZE))
            .ok_or(VmmError::InvalidRange { start: va, end: va })?;
        check_range(va, end)?;
        let mut tables = self.tables.lock_irq();
        self.ensure_unmapped(&mut tables, va, end)?;
        let mut off = 0;
        while va + off < end {
            if let Err(e) = tables.map(self.pmm, va + off, pa + off, flags) {
                error!("map_range {va}..{end}: {e}");
                self.unwind(&mut tables, va, va + off, false);
                return Err(e);
            }
            off += PAGE_SIZE;
        }
        Ok(())
    }

    /// [`unmap_page`](Self::unmap_page) for every page in `[va, va + len)`.
    pub fn unmap_range(&self, va: VirtualAddress, len: u64) {
        let start = va.align_down::<Size4K>();
        for off in (0..len).step_by(PAGE_SIZE as usize) {
            self.unmap_page(start + off);
        }
    }

    /// Register an area.
    ///
    /// # Errors
    /// [`VmmError::Overlap`] if any existing area intersects `vma`;
    /// touching boundaries are fine.
    pub fn add_vma(&self, vma: Vma) -> Result<(), VmmError> {
        self.vmas.write_irq().insert(self.pmm, vma)
    }

    /// Forget the area starting at `start`. Its pages stay mapped.
    ///
    /// # Errors
    /// [`VmmError::NotFound`] if no area starts there.
    pub fn remove_vma(&self, start: VirtualAddress) -> Result<Vma, VmmError> {
        self.vmas.write_irq().remove(self.pmm, start)
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find_vma(&self, va: VirtualAddress) -> Option<Vma> {
        self.vmas.read_irq().find(va).copied()
    }

    #[must_use]
    pub fn vma_count(&self) -> usize {
        self.vmas.read_irq().len()
    }

    /// Visit every area in address order. The area lock is held
    /// throughout, so `f` must not modify this space's areas.
    pub fn for_each_vma(&self, mut f: impl FnMut(&Vma)) {
        for vma in self.vmas.read_irq().iter() {
            f(vma);
        }
    }

    /// Register an area and back every page of it with a zeroed frame.
    ///
    /// # Errors
    /// [`VmmError::Overlap`] or [`VmmError::InvalidRange`] for bad ranges,
    /// [`VmmError::OutOfMemory`] if frames run out, in which case neither
    /// the area nor any of its pages remain.
    pub fn map_anonymous(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> Result<(), VmmError> {
        let mut vmas = self.vmas.write_irq();
        vmas.insert(self.pmm, Vma::new(start, end, flags, kind))?;
        if let Err(e) = self.populate(start, end, flags.page_flags(start.is_user_half())) {
            if let Err(e) = vmas.remove(self.pmm, start) {
                error!("map_anonymous: rollback of area {start} failed: {e}");
            }
            return Err(e);
        }
        debug!("anonymous {kind:?} area {start}..{end}");
        Ok(())
    }

    /// Remove the area starting at `start` and unmap all of its pages.
    ///
    /// # Errors
    /// [`VmmError::NotFound`] if no area starts there.
    pub fn unmap_area(&self, start: VirtualAddress) -> Result<Vma, VmmError> {
        let mut vmas = self.vmas.write_irq();
        let vma = vmas.remove(self.pmm, start)?;
        self.unmap_range(vma.start, vma.len());
        Ok(vma)
    }

    /// Map fresh zeroed frames over `[start, end)`, without touching areas.
    ///
    /// On failure every frame this call mapped is unmapped and freed.
    ///
    /// # Errors
    /// [`VmmError::Overlap`] if a page of the range is already mapped,
    /// [`VmmError::OutOfMemory`] or [`VmmError::InvalidRange`].
    pub fn populate(&self, start: VirtualAddress, end: VirtualAddress, flags: PageFlags) -> Result<(), VmmError> {
        check_range(start, end)?;
        let mut tables = self.tables.lock_irq();
        self.ensure_unmapped(&mut tables, start, end)?;
        let mut va = start;
        while va < end {
            let mapped = self
                .pmm
                .alloc_zeroed_page()
                .ok_or(VmmError::OutOfMemory)
                .and_then(|frame| {
                    tables.map(self.pmm, va, frame.base(), flags).inspect_err(|_| {
                        if let Err(e) = self.pmm.free_frame(frame) {
                            error!("populate: frame {} lost: {e}", frame.base());
                        }
                    })
                });
            if let Err(e) = mapped {
                debug!("populate {start}..{end} failed at {va}: {e}");
                self.unwind(&mut tables, start, va, true);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    fn ensure_unmapped(&self, tables: &mut Tables, start: VirtualAddress, end: VirtualAddress) -> Result<(), VmmError> {
        let mut va = start;
        while va < end {
            if tables.leaf(self.pmm, va).is_some() {
                return Err(VmmError::Overlap { start, end });
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Undo a partial range mapping of `[start, end)`.
    fn unwind(&self, tables: &mut Tables, start: VirtualAddress, end: VirtualAddress, release: bool) {
        let mut va = start;
        while va < end {
            if let Some(entry) = tables.unmap(self.pmm, va) {
                unsafe { tlb::invlpg(va) };
                if release {
                    release_leaf(self.pmm, entry);
                }
            }
            va += PAGE_SIZE;
        }
    }

    /// A new space with copies of every area and every owned user page.
    ///
    /// Pages mapped `BORROWED` are shared rather than copied. On failure the
    /// partial copy is destroyed.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`].
    pub fn duplicate(&self) -> Result<SpaceRef<'p, M>, VmmError> {
        let kernel = self.kernel.clone().unwrap_or_else(|| self.handle());
        let copy = AddressSpace::new_user(&kernel)?;
        let vmas = self.vmas.read_irq();
        *copy.vmas.write_irq() = vmas.try_clone(self.pmm)?;

        let mut copied = 0usize;
        let mut dst = copy.tables.lock_irq();
        self.tables.lock_irq().for_each_user_page(self.pmm, |va, entry| {
            let flags = entry.flags();
            if flags.contains(PageFlags::BORROWED) {
                return dst.map(self.pmm, va, entry.frame(), flags).map(|_| ());
            }
            let frame = self.pmm.alloc_frame().ok_or(VmmError::OutOfMemory)?;
            unsafe {
                self.pmm
                    .mapper()
                    .copy_frame(PhysicalPage::containing(entry.frame()), frame);
            }
            if let Err(e) = dst.map(self.pmm, va, frame.base(), flags) {
                if let Err(e) = self.pmm.free_frame(frame) {
                    error!("duplicate: frame {} lost: {e}", frame.base());
                }
                return Err(e);
            }
            copied += 1;
            Ok(())
        })?;
        drop(dst);
        debug!("address space duplicated, {copied} pages copied");
        Ok(copy)
    }

    /// Another handle to this space.
    fn handle(&self) -> SpaceRef<'p, M> {
        // Spaces only exist in slab storage behind a `SpaceRef`.
        self.refs.fetch_add(1, Ordering::Relaxed);
        SpaceRef { ptr: NonNull::from(self) }
    }

    /// Free every area, every owned frame and table of the user half (and
    /// of the kernel half, for the kernel space), and the PML4.
    fn destroy(&self) {
        self.vmas.write_irq().clear(self.pmm);
        let slots = if self.is_kernel() { 0..KERNEL_SLOTS.end } else { USER_SLOTS };
        self.tables.lock_irq().teardown(self.pmm, slots);
        if let Err(e) = self.pmm.free_frame(self.root) {
            error!("PML4 {} could not be freed: {e}", self.root.base());
        }
        debug!("address space destroyed, root {}", self.root.base());
    }

    #[cfg(test)]
    pub(crate) fn tables_locked_for_test(&self) -> kernel_sync::SpinLockGuard<'_, Tables> {
        self.tables.lock()
    }

    /// Make sure the kernel-half PML4 slot exists so later mappings there
    /// reach every space.
    pub(crate) fn reserve_kernel_slot(&self, slot: usize) -> Result<(), VmmError> {
        self.tables.lock_irq().ensure_pdpt(self.pmm, slot)
    }
}

fn check_page(va: VirtualAddress, pa: PhysicalAddress) -> Result<(), VmmError> {
    if va.is_aligned::<Size4K>() && pa.is_aligned::<Size4K>() && va.is_canonical() {
        Ok(())
    } else {
        Err(VmmError::InvalidRange { start: va, end: va + PAGE_SIZE })
    }
}

/// Counted handle to an [`AddressSpace`].
///
/// Cloning shares the space; dropping the last handle destroys it.
pub struct SpaceRef<'p, M: PhysMapper> {
    ptr: NonNull<AddressSpace<'p, M>>,
}

// SAFETY: the space is internally synchronised and only freed by the last handle.
unsafe impl<M: PhysMapper + Sync> Send for SpaceRef<'_, M> {}
unsafe impl<M: PhysMapper + Sync> Sync for SpaceRef<'_, M> {}

impl<M: PhysMapper> SpaceRef<'_, M> {
    /// Whether both handles refer to the same space.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl<'p, M: PhysMapper> Deref for SpaceRef<'p, M> {
    type Target = AddressSpace<'p, M>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: kept alive by this handle's count.
        unsafe { self.ptr.as_ref() }
    }
}

impl<M: PhysMapper> Clone for SpaceRef<'_, M> {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::Relaxed);
        Self { ptr: self.ptr }
    }
}

impl<M: PhysMapper> Drop for SpaceRef<'_, M> {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        let pmm = self.pmm;
        self.destroy();
        // SAFETY: last handle; drops the kernel reference too.
        unsafe { pmm.slab_drop(self.ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pmm;
    use crate::table::PageTable;
    use kernel_pmm::HostRam;

    const MIB: usize = 1024 * 1024;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn used(pmm: &PhysicalMemoryManager<HostRam>) -> usize {
        pmm.shrink_caches();
        pmm.get_stats().used_pages
    }

    #[test]
    fn map_translate_unmap() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let space = AddressSpace::new_user(&kernel).unwrap();
        let frame = pmm.alloc_frame().unwrap();

        space.map_page(va(0x40_0000), frame.base(), PageFlags::USER_RW).unwrap();
        assert_eq!(space.get_physical_address(va(0x40_0123)), Some(frame.base() + 0x123));
        assert_eq!(space.page_flags(va(0x40_0000)), Some(PageFlags::USER_RW));
        assert_eq!(space.get_physical_address(va(0x40_1000)), None);
        assert_eq!(kernel.get_physical_address(va(0x40_0000)), None);

        let before = pmm.get_stats().free_pages;
        space.unmap_page(va(0x40_0000));
        assert_eq!(space.get_physical_address(va(0x40_0000)), None);
        // the frame and the PDPT, PD and PT that held it
        assert_eq!(pmm.get_stats().free_pages, before + 4);
        space.unmap_page(va(0x40_0000));
        space.unmap_page(va(0x7000_0000_0000));
    }

    #[test]
    fn intermediate_tables_follow_the_half() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        kernel.reserve_kernel_slot(384).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        kernel.map_page(va(0x1000), frame.base(), PageFlags::KERNEL_RW).unwrap();
        kernel.map_page(va(0xFFFF_C000_0000_0000), frame.base(), PageFlags::KERNEL_RW).unwrap();

        let pml4: &PageTable = unsafe { pmm.mapper().phys_to_mut(kernel.root().base()) };
        assert!(pml4.get(0).user() && pml4.get(0).writable());
        assert!(!pml4.get(384).user() && pml4.get(384).writable());
    }

    #[test]
    fn mapping_is_idempotent() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let a = pmm.alloc_frame().unwrap();
        let b = pmm.alloc_frame().unwrap();
        kernel.map_page(va(0x5000), a.base(), PageFlags::KERNEL_RW).unwrap();
        kernel.map_page(va(0x5000), b.base(), PageFlags::USER_RW).unwrap();
        assert_eq!(kernel.get_physical_address(va(0x5000)), Some(a.base()));
        assert_eq!(kernel.page_flags(va(0x5000)), Some(PageFlags::KERNEL_RW));
        assert!(matches!(
            kernel.map_page(va(0x5800), b.base(), PageFlags::KERNEL_RW),
            Err(VmmError::InvalidRange { .. })
        ));
    }

    #[test]
    fn kernel_half_is_shared() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        kernel.reserve_kernel_slot(384).unwrap();
        let user = AddressSpace::new_user(&kernel).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        kernel
            .map_page(va(0xFFFF_C000_0000_0000), frame.base(), PageFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(user.get_physical_address(va(0xFFFF_C000_0000_0000)), Some(frame.base()));
        assert_eq!(kernel.ref_count(), 2);
        drop(user);
        assert_eq!(kernel.ref_count(), 1);
    }

    #[test]
    fn unreserved_kernel_slots_are_refused() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        kernel.reserve_kernel_slot(384).unwrap();
        let user = AddressSpace::new_user(&kernel).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        let before = used(&pmm);

        // Slot 400 was never reserved, so no space may build a PDPT there.
        let outside = va(0xFFFF_C800_0000_0000);
        for space in [&user, &kernel] {
            assert!(matches!(
                space.map_page(outside, frame.base(), PageFlags::KERNEL_RW),
                Err(VmmError::InvalidRange { .. })
            ));
            assert_eq!(space.get_physical_address(outside), None);
        }
        assert_eq!(used(&pmm), before);

        user.map_page(va(0xFFFF_C000_0000_0000), frame.base(), PageFlags::KERNEL_RW)
            .unwrap();
        assert_eq!(kernel.get_physical_address(va(0xFFFF_C000_0000_0000)), Some(frame.base()));
        drop(user);
        assert_eq!(kernel.ref_count(), 1);
    }

    #[test]
    fn vma_scenario() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let space = AddressSpace::new_user(&kernel).unwrap();
        let area = |s, e| Vma::new(va(s), va(e), VmaFlags::RW, VmaKind::Anonymous);
        space.add_vma(area(0x1000, 0x2000)).unwrap();
        assert!(matches!(space.add_vma(area(0x1800, 0x2800)), Err(VmmError::Overlap { .. })));
        space.add_vma(area(0x2000, 0x3000)).unwrap();
        assert_eq!(space.vma_count(), 2);
        assert_eq!(space.find_vma(va(0x2abc)).unwrap().start, va(0x2000));
        assert_eq!(space.remove_vma(va(0x1000)).unwrap().end, va(0x2000));
        assert!(space.find_vma(va(0x1000)).is_none());
        let mut seen = 0;
        space.for_each_vma(|v| {
            assert_eq!(v.start, va(0x2000));
            seen += 1;
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn anonymous_areas_are_backed_and_released() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let space = AddressSpace::new_user(&kernel).unwrap();
        let baseline = used(&pmm);

        space
            .map_anonymous(va(0x10_0000), va(0x10_4000), VmaFlags::RW, VmaKind::Heap)
            .unwrap();
        for page in 0..4 {
            let pa = space.get_physical_address(va(0x10_0000 + page * 0x1000)).unwrap();
            let bytes = unsafe { core::slice::from_raw_parts(pmm.mapper().phys_to_ptr(pa), 4096) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
        assert_eq!(
            space.page_flags(va(0x10_0000)),
            Some(PageFlags::USER_RW | PageFlags::NO_EXECUTE)
        );

        space.unmap_area(va(0x10_0000)).unwrap();
        assert_eq!(space.vma_count(), 0);
        assert_eq!(used(&pmm), baseline);
    }

    #[test]
    fn anonymous_mapping_unwinds_when_memory_runs_out() {
        let pmm = pmm(128 * 1024);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let space = AddressSpace::new_user(&kernel).unwrap();
        let baseline = used(&pmm);

        let err = space.map_anonymous(va(0x20_0000), va(0x30_0000), VmaFlags::RW, VmaKind::Anonymous);
        assert_eq!(err, Err(VmmError::OutOfMemory));
        assert_eq!(space.vma_count(), 0);
        assert_eq!(space.get_physical_address(va(0x20_0000)), None);
        assert_eq!(used(&pmm), baseline);
    }

    #[test]
    fn duplicate_copies_pages_and_areas() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let parent = AddressSpace::new_user(&kernel).unwrap();
        parent
            .map_anonymous(va(0x40_0000), va(0x40_2000), VmaFlags::RW, VmaKind::Anonymous)
            .unwrap();
        let shared = pmm.alloc_frame().unwrap();
        parent
            .map_page(va(0x50_0000), shared.base(), PageFlags::USER_RW | PageFlags::BORROWED)
            .unwrap();
        let pa = parent.get_physical_address(va(0x40_0000)).unwrap();
        unsafe { pmm.mapper().phys_to_ptr(pa).write(0x5A) };

        let child = parent.duplicate().unwrap();
        assert_eq!(child.vma_count(), 1);
        let child_pa = child.get_physical_address(va(0x40_0000)).unwrap();
        assert_ne!(child_pa, pa);
        assert_eq!(unsafe { pmm.mapper().phys_to_ptr(child_pa).read() }, 0x5A);
        assert_eq!(child.get_physical_address(va(0x50_0000)), Some(shared.base()));
        assert!(child.get_physical_address(va(0x40_1000)).is_some());

        unsafe { pmm.mapper().phys_to_ptr(child_pa).write(0x11) };
        assert_eq!(unsafe { pmm.mapper().phys_to_ptr(pa).read() }, 0x5A);
    }

    #[test]
    fn destroying_a_space_returns_everything() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let baseline = used(&pmm);

        let space = AddressSpace::new_user(&kernel).unwrap();
        space
            .map_anonymous(va(0x1000), va(0x9000), VmaFlags::RW, VmaKind::Stack)
            .unwrap();
        space
            .map_anonymous(va(0x7F00_0000_0000), va(0x7F00_0000_2000), VmaFlags::READ, VmaKind::File)
            .unwrap();
        let copy = space.duplicate().unwrap();
        let again = space.clone();
        drop(space);
        assert!(again.get_physical_address(va(0x1000)).is_some());
        drop(again);
        drop(copy);
        assert_eq!(used(&pmm), baseline);
    }

    #[test]
    fn kernel_space_needs_a_set_up_pmm() {
        let pmm = PhysicalMemoryManager::new(HostRam::new(64 * 1024), kernel_pmm::PmmConfig::DEFAULT);
        assert!(matches!(AddressSpace::new_kernel(&pmm), Err(VmmError::NotInitialized)));
    }

    #[test]
    fn duplicating_the_kernel_space_gives_a_user_space() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let copy = kernel.duplicate().unwrap();
        assert!(!copy.is_kernel());
        assert_eq!(kernel.ref_count(), 2);
    }

    #[test]
    fn ranges_refuse_mapped_pages() {
        let pmm = pmm(MIB);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        kernel.map_page(va(0x3000), frame.base(), PageFlags::KERNEL_RW).unwrap();
        let borrowed = PageFlags::KERNEL_RW | PageFlags::BORROWED;
        assert!(matches!(
            kernel.map_range(va(0x1000), PhysicalAddress::new(0x8_0000), 0x4000, borrowed),
            Err(VmmError::Overlap { .. })
        ));
        assert_eq!(kernel.get_physical_address(va(0x1000)), None);

        kernel.map_range(va(0x40_0000), PhysicalAddress::new(0x8_0000), 0x3000, borrowed).unwrap();
        assert_eq!(kernel.get_physical_address(va(0x40_2fff)), Some(PhysicalAddress::new(0x8_2fff)));
        let free = pmm.get_stats().free_pages;
        kernel.unmap_range(va(0x40_0000), 0x3000);
        // only the PT goes back; the PD and PDPT still hold 0x3000
        assert_eq!(pmm.get_stats().free_pages, free + 1);
    }
}
