//! Virtual memory areas and the sorted list an address space keeps them in.
//!
//! Nodes come from the PMM's slab caches rather than the kernel heap, since
//! the heap itself is built on top of address spaces.

use core::fmt;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{KERNEL_HALF_START, Size4K, USER_HALF_END, VirtualAddress};
use kernel_pmm::{PhysMapper, PhysicalMemoryManager};
use log::error;

use crate::entry::PageFlags;
use crate::error::VmmError;

bitflags::bitflags! {
    /// Access and sharing properties of an area.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const SHARED = 1 << 3;
        const PRIVATE = 1 << 4;
        /// The area may be extended upwards (heaps).
        const GROW_UP = 1 << 5;
        /// The area may be extended downwards (stacks).
        const GROW_DOWN = 1 << 6;
    }
}

impl VmaFlags {
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Leaf flags for pages of an area with these flags.
    #[must_use]
    pub const fn page_flags(self, user: bool) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        if self.contains(Self::WRITE) {
            flags = flags.union(PageFlags::WRITABLE);
        }
        if !self.contains(Self::EXECUTE) {
            flags = flags.union(PageFlags::NO_EXECUTE);
        }
        if user {
            flags = flags.union(PageFlags::USER);
        }
        flags
    }
}

/// What backs an area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum VmaKind {
    Anonymous,
    File,
    SharedMemory,
    Stack,
    Heap,
    Device,
}

/// Opaque handle to the object backing a `File`, `SharedMemory` or `Device`
/// area. Its meaning belongs to whoever created the area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BackingRef(pub u64);

/// A page-aligned range `[start, end)` with uniform flags and backing.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmaFlags,
    pub kind: VmaKind,
    /// Offset of `start` within the backing object.
    pub offset: u64,
    pub backing: Option<BackingRef>,
}

impl Vma {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress, flags: VmaFlags, kind: VmaKind) -> Self {
        Self {
            start,
            end,
            flags,
            kind,
            offset: 0,
            backing: None,
        }
    }

    #[must_use]
    pub const fn with_backing(mut self, backing: BackingRef, offset: u64) -> Self {
        self.backing = Some(backing);
        self.offset = offset;
        self
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end.as_u64()
    }

    /// Half-open ranges that only touch do not overlap.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start.as_u64() < end.as_u64() && start.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.start.is_user_half()
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vma({:#x}..{:#x} {:?} {:?})",
            self.start.as_u64(),
            self.end.as_u64(),
            self.kind,
            self.flags
        )
    }
}

/// Accepts non-empty page-aligned ranges that stay within one canonical half.
pub(crate) const fn check_range(start: VirtualAddress, end: VirtualAddress) -> Result<(), VmmError> {
    let (s, e) = (start.as_u64(), end.as_u64());
    let aligned = start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>();
    let one_half = e <= USER_HALF_END || s >= KERNEL_HALF_START;
    if s < e && aligned && one_half {
        Ok(())
    } else {
        Err(VmmError::InvalidRange { start, end })
    }
}

struct VmaNode {
    vma: Vma,
    prev: *mut VmaNode,
    next: *mut VmaNode,
}

/// Doubly linked list of areas, sorted by start, never overlapping.
///
/// The list does not free its nodes on drop; the owner calls
/// [`clear`](Self::clear) with the manager the nodes came from.
pub(crate) struct VmaList {
    head: *mut VmaNode,
    len: usize,
}

// SAFETY: the nodes are owned by the list and only reached through it.
unsafe impl Send for VmaList {}
unsafe impl Sync for VmaList {}

impl VmaList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    fn nodes(&self) -> impl Iterator<Item = *mut VmaNode> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let node = NonNull::new(cur)?;
            // SAFETY: list nodes stay valid while the list is borrowed.
            cur = unsafe { node.as_ref().next };
            Some(node.as_ptr())
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Vma> + '_ {
        self.nodes().map(|n| unsafe { &(*n).vma })
    }

    /// The area containing `va`.
    pub(crate) fn find(&self, va: VirtualAddress) -> Option<&Vma> {
        self.iter()
            .take_while(|v| v.start.as_u64() <= va.as_u64())
            .find(|v| v.contains(va))
    }

    /// Insert `vma` at its sorted position.
    ///
    /// Collisions are reported before alignment problems, so a misaligned
    /// range that hits an existing area is an [`VmmError::Overlap`].
    pub(crate) fn insert<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>, vma: Vma) -> Result<(), VmmError> {
        if vma.start.as_u64() >= vma.end.as_u64() {
            return Err(VmmError::InvalidRange {
                start: vma.start,
                end: vma.end,
            });
        }
        let mut prev = ptr::null_mut();
        for node in self.nodes() {
            let existing = unsafe { &(*node).vma };
            if existing.overlaps(vma.start, vma.end) {
                return Err(VmmError::Overlap {
                    start: vma.start,
                    end: vma.end,
                });
            }
            if existing.start.as_u64() < vma.start.as_u64() {
                prev = node;
            }
        }
        check_range(vma.start, vma.end)?;
        let node = pmm
            .slab_new(VmaNode {
                vma,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            })
            .map_err(|_| VmmError::OutOfMemory)?;
        unsafe { self.link_after(prev, node.as_ptr()) };
        Ok(())
    }

    /// Unlink the area starting exactly at `start`.
    pub(crate) fn remove<M: PhysMapper>(
        &mut self,
        pmm: &PhysicalMemoryManager<M>,
        start: VirtualAddress,
    ) -> Result<Vma, VmmError> {
        let node = self
            .nodes()
            .find(|&n| unsafe { (*n).vma.start } == start)
            .ok_or(VmmError::NotFound(start))?;
        let vma = unsafe {
            self.unlink(node);
            (*node).vma
        };
        unsafe { Self::release(pmm, node) };
        Ok(vma)
    }

    /// Free every node.
    pub(crate) fn clear<M: PhysMapper>(&mut self, pmm: &PhysicalMemoryManager<M>) {
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            unsafe { Self::release(pmm, cur) };
            cur = next;
        }
        self.head = ptr::null_mut();
        self.len = 0;
    }

    /// A node-for-node copy. On failure nothing of the copy survives.
    pub(crate) fn try_clone<M: PhysMapper>(&self, pmm: &PhysicalMemoryManager<M>) -> Result<Self, VmmError> {
        let mut copy = Self::new();
        let mut last = ptr::null_mut();
        for vma in self.iter() {
            let Ok(node) = pmm.slab_new(VmaNode {
                vma: *vma,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            }) else {
                copy.clear(pmm);
                return Err(VmmError::OutOfMemory);
            };
            unsafe { copy.link_after(last, node.as_ptr()) };
            last = node.as_ptr();
        }
        Ok(copy)
    }

    /// # Safety
    /// `prev` is null or a node of this list; `node` is not linked anywhere.
    unsafe fn link_after(&mut self, prev: *mut VmaNode, node: *mut VmaNode) {
        unsafe {
            let next = if prev.is_null() { self.head } else { (*prev).next };
            (*node).prev = prev;
            (*node).next = next;
            if !next.is_null() {
                (*next).prev = node;
            }
            if prev.is_null() {
                self.head = node;
            } else {
                (*prev).next = node;
            }
        }
        self.len += 1;
    }

    /// # Safety
    /// `node` must be linked into this list.
    unsafe fn unlink(&mut self, node: *mut VmaNode) {
        unsafe {
            let (prev, next) = ((*node).prev, (*node).next);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
        self.len -= 1;
    }

    unsafe fn release<M: PhysMapper>(pmm: &PhysicalMemoryManager<M>, node: *mut VmaNode) {
        let Some(node) = NonNull::new(node) else {
            return;
        };
        if let Err(e) = unsafe { pmm.slab_free(node) } {
            error!("vma node {:p} could not be freed: {e}", node.as_ptr());
        }
    }
}
