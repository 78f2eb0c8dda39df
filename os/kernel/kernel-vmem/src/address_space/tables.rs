//! Walking, building and pruning the four-level tree of one address space.
//!
//! Every function here expects the caller to hold the space's table lock.
//! Intermediate tables are created on demand and freed as soon as they
//! become empty, except for PDPTs of the kernel half, which are shared by
//! every address space and live as long as the kernel space.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress};
use kernel_pmm::{PhysMapper, PhysicalMemoryManager};
use log::{trace, warn};

use crate::entry::{PageFlags, PageTableEntry};
use crate::error::VmmError;
use crate::table::{ENTRIES, Level, PageTable, join_indices, split_indices};
use kernel_info::memory::PML4_HALF;

/// The PML4 slots of the user half.
pub(crate) const USER_SLOTS: core::ops::Range<usize> = 0..PML4_HALF;

/// The PML4 slots of the kernel half.
pub(crate) const KERNEL_SLOTS: core::ops::Range<usize> = PML4_HALF..ENTRIES;

pub(crate) struct Tables {
    root: PhysicalPage<Size4K>,
}

/// Reach the table stored in `frame`.
///
/// # Safety
/// `frame` must hold a page table of the tree being walked, and the table
/// lock of that tree must be held for `'a`.
unsafe fn table<'a, M: PhysMapper>(pmm: &PhysicalMemoryManager<M>, frame: PhysicalAddress) -> &'a mut PageTable {
    unsafe { pmm.mapper().phys_to_mut(frame) }
}

fn free_table<M: PhysMapper>(pmm: &PhysicalMemoryManager<M>, frame: PhysicalAddress) {
    if let Err(e) = pmm.free_frame(PhysicalPage::containing(frame)) {
        warn!("page table {frame} could not be freed: {e}");
    }
}

/// Give a leaf's frame back unless the mapping only borrows it.
pub(crate) fn release_leaf<M: PhysMapper>(pmm: &PhysicalMemoryManager<M>, entry: PageTableEntry) {
    if entry.flags().contains(PageFlags::BORROWED) {
        return;
    }
    if let Err(e) = pmm.free_frame(PhysicalPage::containing(entry.frame())) {
        warn!("frame {} could not be freed: {e}", entry.frame());
    }
}

/// The table `parent[index]` points at, created when absent.
fn descend<'a, M: PhysMapper>(
    pmm: &PhysicalMemoryManager<M>,
    parent: &mut PageTable,
    index: usize,
    va: VirtualAddress,
) -> Result<&'a mut PageTable, VmmError> {
    let e = parent.get(index);
    if e.is_huge() {
        return Err(VmmError::InvalidRange { start: va, end: va + 4096 });
    }
    if e.present() {
        return Ok(unsafe { table(pmm, e.frame()) });
    }
    let frame = pmm.alloc_zeroed_page().ok_or(VmmError::OutOfMemory)?;
    parent.set(
        index,
        PageTableEntry::with_frame(frame.base(), PageFlags::table(va.is_user_half())),
    );
    Ok(unsafe { table(pmm, frame.base()) })
}

impl Tables {
    pub(crate) const fn new(root: PhysicalPage<Size4K>) -> Self {
        Self { root }
    }

    fn root_table<'a, M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>) -> &'a mut PageTable {
        unsafe { table(pmm, self.root.base()) }
    }

    /// The PT covering `va`, building missing levels on the way.
    ///
    /// Kernel-half PDPTs are never built here: a slot that was not reserved
    /// through [`ensure_pdpt`](Self::ensure_pdpt) is not shared and is
    /// refused.
    fn walk_create<'a, M: PhysMapper>(
        &mut self,
        pmm: &PhysicalMemoryManager<M>,
        va: VirtualAddress,
    ) -> Result<&'a mut PageTable, VmmError> {
        let [i4, i3, i2, _] = split_indices(va);
        let root = self.root_table(pmm);
        if KERNEL_SLOTS.contains(&i4) && !root.get(i4).present() {
            return Err(VmmError::InvalidRange { start: va, end: va + 4096 });
        }
        let pdpt = descend(pmm, root, i4, va)?;
        let pd = descend(pmm, pdpt, i3, va)?;
        descend(pmm, pd, i2, va)
    }

    /// The PT covering `va`, if every level exists and none is a huge leaf.
    fn walk<'a, M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, va: VirtualAddress) -> Option<&'a mut PageTable> {
        let [i4, i3, i2, _] = split_indices(va);
        let mut t = self.root_table(pmm);
        for i in [i4, i3, i2] {
            let e = t.get(i);
            if !e.present() || e.is_huge() {
                return None;
            }
            t = unsafe { table(pmm, e.frame()) };
        }
        Some(t)
    }

    /// Install a 4 KiB leaf. Returns `false` if `va` was already mapped, in
    /// which case nothing changes.
    pub(crate) fn map<M: PhysMapper>(
        &mut self,
        pmm: &PhysicalMemoryManager<M>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<bool, VmmError> {
        let pt = match self.walk_create(pmm, va) {
            Ok(pt) => pt,
            Err(e) => {
                self.prune(pmm, va);
                return Err(e);
            }
        };
        let i1 = Level::Pt.index(va);
        if pt.get(i1).present() {
            return Ok(false);
        }
        pt.set(i1, PageTableEntry::with_frame(pa, flags | PageFlags::PRESENT));
        trace!("map {va} -> {pa} {flags:?}");
        Ok(true)
    }

    /// Clear the 4 KiB leaf at `va` and return what it was.
    pub(crate) fn unmap<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, va: VirtualAddress) -> Option<PageTableEntry> {
        let pt = self.walk(pmm, va)?;
        let i1 = Level::Pt.index(va);
        let old = pt.get(i1);
        if !old.present() {
            return None;
        }
        pt.clear(i1);
        trace!("unmap {va} (was {})", old.frame());
        self.prune(pmm, va);
        Some(old)
    }

    /// Free the tables on the path to `va` that no longer hold anything.
    fn prune<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, va: VirtualAddress) {
        let [i4, i3, i2, _] = split_indices(va);
        let pml4 = self.root_table(pmm);
        let e4 = pml4.get(i4);
        if !e4.present() {
            return;
        }
        let pdpt = unsafe { table(pmm, e4.frame()) };
        let e3 = pdpt.get(i3);
        if e3.present() && !e3.is_huge() {
            let pd = unsafe { table(pmm, e3.frame()) };
            let e2 = pd.get(i2);
            if e2.present() && !e2.is_huge() && unsafe { table(pmm, e2.frame()) }.is_empty() {
                pd.clear(i2);
                free_table(pmm, e2.frame());
            }
            if pd.is_empty() {
                pdpt.clear(i3);
                free_table(pmm, e3.frame());
            }
        }
        if va.is_user_half() && pdpt.is_empty() {
            pml4.clear(i4);
            free_table(pmm, e4.frame());
        }
    }

    /// Physical address and flags of the leaf translating `va`, at any size.
    pub(crate) fn leaf<M: PhysMapper>(
        &mut self,
        pmm: &PhysicalMemoryManager<M>,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let [i4, i3, i2, i1] = split_indices(va);
        let e4 = self.root_table(pmm).get(i4);
        if !e4.present() {
            return None;
        }
        let e3 = unsafe { table(pmm, e4.frame()) }.get(i3);
        if !e3.present() {
            return None;
        }
        if e3.page_size() {
            let base = e3.frame().align_down::<Size1G>();
            return Some((base + va.offset::<Size1G>(), e3.flags()));
        }
        let e2 = unsafe { table(pmm, e3.frame()) }.get(i2);
        if !e2.present() {
            return None;
        }
        if e2.page_size() {
            let base = e2.frame().align_down::<Size2M>();
            return Some((base + va.offset::<Size2M>(), e2.flags()));
        }
        let e1 = unsafe { table(pmm, e2.frame()) }.get(i1);
        e1.present().then_some((e1.frame() + va.offset::<Size4K>(), e1.flags()))
    }

    /// Make sure kernel PML4 slot `slot` points at a PDPT.
    pub(crate) fn ensure_pdpt<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, slot: usize) -> Result<(), VmmError> {
        debug_assert!(KERNEL_SLOTS.contains(&slot));
        let va = join_indices([slot, 0, 0, 0]);
        descend(pmm, self.root_table(pmm), slot, va).map(|_| ())
    }

    /// Copy the kernel-half PML4 entries of `kernel`.
    pub(crate) fn share_kernel_half<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, kernel: &mut Self) {
        let src = kernel.root_table(pmm);
        let dst = self.root_table(pmm);
        for slot in KERNEL_SLOTS {
            dst.set(slot, src.get(slot));
        }
    }

    /// Call `f` for every 4 KiB leaf of the user half, in address order.
    ///
    /// Huge leaves are skipped; this tree never creates them.
    pub(crate) fn for_each_user_page<M: PhysMapper>(
        &mut self,
        pmm: &PhysicalMemoryManager<M>,
        mut f: impl FnMut(VirtualAddress, PageTableEntry) -> Result<(), VmmError>,
    ) -> Result<(), VmmError> {
        let pml4 = self.root_table(pmm);
        for (i4, e4) in pml4.present(USER_SLOTS) {
            let pdpt = unsafe { table(pmm, e4.frame()) };
            for (i3, e3) in pdpt.present(0..ENTRIES) {
                if e3.page_size() {
                    warn!("skipping 1 GiB leaf at {}", join_indices([i4, i3, 0, 0]));
                    continue;
                }
                let pd = unsafe { table(pmm, e3.frame()) };
                for (i2, e2) in pd.present(0..ENTRIES) {
                    if e2.page_size() {
                        warn!("skipping 2 MiB leaf at {}", join_indices([i4, i3, i2, 0]));
                        continue;
                    }
                    let pt = unsafe { table(pmm, e2.frame()) };
                    for (i1, e1) in pt.present(0..ENTRIES) {
                        f(join_indices([i4, i3, i2, i1]), e1)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Free every owned frame and every table below the PML4 in `slots`.
    pub(crate) fn teardown<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, slots: core::ops::Range<usize>) {
        let pml4 = self.root_table(pmm);
        for i4 in slots {
            let e4 = pml4.get(i4);
            if e4.present() {
                Self::free_subtree(pmm, e4.frame(), Level::Pdpt);
                pml4.clear(i4);
            }
        }
    }

    fn free_subtree<M: PhysMapper>(pmm: &PhysicalMemoryManager<M>, frame: PhysicalAddress, level: Level) {
        let t = unsafe { table(pmm, frame) };
        for (_, e) in t.present(0..ENTRIES) {
            match level.child() {
                None => release_leaf(pmm, e),
                // Huge leaves are never owned by the tree.
                Some(_) if e.page_size() => {}
                Some(child) => Self::free_subtree(pmm, e.frame(), child),
            }
        }
        free_table(pmm, frame);
    }
}
