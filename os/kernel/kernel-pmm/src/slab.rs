//! # Slab Caches
//!
//! A [`SlabCache`] serves objects of one fixed size out of single 4 KiB pages
//! taken from a [`PageSource`] (the buddy allocator, in the kernel). Every page
//! ("slab") starts with a header and is followed by equally sized cells:
//!
//! ```text
//! ┌────────────┬──────────────────┬──────────────────┬─────┬───────┐
//! │ SlabHeader │ Cell │ object 0  │ Cell │ object 1  │ ... │ slack │
//! └────────────┴──────────────────┴──────────────────┴─────┴───────┘
//!   links, counts   ▲ back-pointer to the header, next free cell
//! ```
//!
//! Each slab is on exactly one of three lists, chosen by how many cells are
//! still free: *full* (none), *partial* (some), *free* (all). Allocation
//! prefers partial slabs, then free slabs, and only then grows the cache by
//! one page.

use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::debug;

use crate::size_class::SLAB_ALIGN;

const SLAB_MAGIC: u32 = 0x51AB_CA5E;

/// `next_free` value of a cell whose object is handed out.
const LIVE: *mut Cell = ptr::without_provenance_mut(usize::MAX);

/// Where slab pages come from and go back to.
pub trait PageSource {
    /// A fresh 4 KiB page, as its frame and a pointer through which it is accessed.
    fn alloc_page(&self) -> Option<(PhysicalAddress, NonNull<u8>)>;

    /// Return a page obtained from [`alloc_page`](Self::alloc_page).
    ///
    /// # Safety
    /// Nothing may reference the page afterwards.
    unsafe fn free_page(&self, page: PhysicalAddress);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SlabError {
    #[error("object was not allocated from this cache")]
    ForeignObject,
    #[error("object is already free")]
    DoubleFree,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ListKind {
    Full = 0,
    Partial = 1,
    Free = 2,
}

#[repr(C, align(16))]
struct SlabHeader {
    magic: u32,
    list: ListKind,
    object_size: u16,
    free_count: u16,
    total_count: u16,
    page: PhysicalAddress,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
    free_cells: *mut Cell,
}

#[repr(C, align(16))]
struct Cell {
    slab: *mut SlabHeader,
    next_free: *mut Cell,
}

const HEADER_BYTES: usize = size_of::<SlabHeader>();
const CELL_BYTES: usize = size_of::<Cell>();

const _: () = {
    assert!(HEADER_BYTES.is_multiple_of(SLAB_ALIGN));
    assert!(CELL_BYTES == SLAB_ALIGN);
};

#[derive(Copy, Clone)]
struct SlabList {
    head: *mut SlabHeader,
    len: usize,
}

impl SlabList {
    const EMPTY: Self = Self {
        head: ptr::null_mut(),
        len: 0,
    };

    fn first(&self) -> Option<*mut SlabHeader> {
        (!self.head.is_null()).then_some(self.head)
    }

    /// # Safety
    /// `slab` must be a live header not on any list.
    unsafe fn push(&mut self, slab: *mut SlabHeader) {
        unsafe {
            (*slab).prev = ptr::null_mut();
            (*slab).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = slab;
            }
        }
        self.head = slab;
        self.len += 1;
    }

    /// # Safety
    /// `slab` must be on this list.
    unsafe fn remove(&mut self, slab: *mut SlabHeader) {
        unsafe {
            let (prev, next) = ((*slab).prev, (*slab).next);
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
        }
        self.len -= 1;
    }
}

/// Counters describing one cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlabStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub free_slabs: usize,
    pub objects_in_use: usize,
    pub objects_capacity: usize,
}

/// Fixed-size object cache.
pub struct SlabCache {
    object_size: usize,
    stride: usize,
    per_slab: usize,
    lists: [SlabList; 3],
    in_use: usize,
}

// Safety: the raw pointers refer to pages owned by the cache; access is serialized by its lock.
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// A cache for objects of `object_size` bytes, aligned to 16.
    ///
    /// # Panics
    /// If not even one object fits a page.
    #[must_use]
    pub const fn new(object_size: usize) -> Self {
        let payload = if object_size == 0 { 1 } else { object_size };
        let stride = (CELL_BYTES + payload).next_multiple_of(SLAB_ALIGN);
        assert!(HEADER_BYTES + stride <= PAGE_SIZE as usize, "object too large for a slab");
        Self {
            object_size,
            stride,
            per_slab: (PAGE_SIZE as usize - HEADER_BYTES) / stride,
            lists: [SlabList::EMPTY; 3],
            in_use: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    #[must_use]
    pub const fn objects_per_slab(&self) -> usize {
        self.per_slab
    }

    #[inline]
    #[must_use]
    pub const fn objects_in_use(&self) -> usize {
        self.in_use
    }

    /// One object, 16-byte aligned. `None` if no page could be obtained.
    pub fn alloc<S: PageSource + ?Sized>(&mut self, pages: &S) -> Option<NonNull<u8>> {
        let slab = match self.list(ListKind::Partial).first() {
            Some(s) => s,
            None => match self.list(ListKind::Free).first() {
                Some(s) => s,
                None => self.grow(pages)?,
            },
        };

        // SAFETY: list members are live headers with at least one free cell.
        unsafe {
            let h = &mut *slab;
            let cell = h.free_cells;
            debug_assert!(!cell.is_null() && h.free_count > 0);
            h.free_cells = (*cell).next_free;
            (*cell).next_free = LIVE;
            h.free_count -= 1;
            let target = if h.free_count == 0 {
                ListKind::Full
            } else {
                ListKind::Partial
            };
            self.relink(slab, target);
            self.in_use += 1;
            Some(NonNull::new_unchecked(cell.cast::<u8>().add(CELL_BYTES)))
        }
    }

    /// Return an object to its slab.
    ///
    /// # Errors
    /// [`SlabError::ForeignObject`] if the cell header does not point back to a
    /// slab of this cache, [`SlabError::DoubleFree`] if the object is not live.
    ///
    /// # Safety
    /// `obj` must have been returned by `alloc` on some slab cache, so that
    /// the 16 bytes before it are a readable cell header.
    pub unsafe fn free(&mut self, obj: NonNull<u8>) -> Result<(), SlabError> {
        let cell = unsafe { obj.as_ptr().sub(CELL_BYTES).cast::<Cell>() };
        let slab = unsafe { (*cell).slab };

        let page_of_cell = (cell as usize) & !(PAGE_SIZE as usize - 1);
        if slab.is_null() || slab as usize != page_of_cell {
            return Err(SlabError::ForeignObject);
        }
        // SAFETY: `slab` is the start of the page holding the cell.
        unsafe {
            let h = &mut *slab;
            if h.magic != SLAB_MAGIC || usize::from(h.object_size) != self.object_size {
                return Err(SlabError::ForeignObject);
            }
            if (*cell).next_free != LIVE {
                return Err(SlabError::DoubleFree);
            }
            (*cell).next_free = h.free_cells;
            h.free_cells = cell;
            h.free_count += 1;
            let target = if h.free_count == h.total_count {
                ListKind::Free
            } else {
                ListKind::Partial
            };
            self.relink(slab, target);
        }
        self.in_use -= 1;
        Ok(())
    }

    /// Give every completely free slab back to `pages`; returns how many.
    pub fn shrink<S: PageSource + ?Sized>(&mut self, pages: &S) -> usize {
        let mut released = 0;
        while let Some(slab) = self.list(ListKind::Free).first() {
            // SAFETY: on the free list, so no object of this slab is live.
            unsafe {
                self.lists[ListKind::Free as usize].remove(slab);
                (*slab).magic = 0;
                let page = (*slab).page;
                pages.free_page(page);
            }
            released += 1;
        }
        if released > 0 {
            debug!("slab[{}]: released {released} free slabs", self.object_size);
        }
        released
    }

    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let slabs = self.lists.iter().map(|l| l.len).sum::<usize>();
        SlabStats {
            object_size: self.object_size,
            objects_per_slab: self.per_slab,
            full_slabs: self.list(ListKind::Full).len,
            partial_slabs: self.list(ListKind::Partial).len,
            free_slabs: self.list(ListKind::Free).len,
            objects_in_use: self.in_use,
            objects_capacity: slabs * self.per_slab,
        }
    }

    /// Recount live objects by walking all three lists.
    ///
    /// Returns `None` if a slab is on the wrong list or has a broken header.
    #[must_use]
    pub fn verify(&self) -> Option<usize> {
        let mut live = 0;
        for kind in [ListKind::Full, ListKind::Partial, ListKind::Free] {
            let mut cur = self.list(kind).head;
            let mut seen = 0;
            while !cur.is_null() {
                // SAFETY: list members are live headers.
                let h = unsafe { &*cur };
                let placed = match kind {
                    ListKind::Full => h.free_count == 0,
                    ListKind::Partial => h.free_count > 0 && h.free_count < h.total_count,
                    ListKind::Free => h.free_count == h.total_count,
                };
                if h.magic != SLAB_MAGIC || h.list != kind || !placed {
                    return None;
                }
                live += usize::from(h.total_count - h.free_count);
                seen += 1;
                cur = h.next;
            }
            if seen != self.list(kind).len {
                return None;
            }
        }
        Some(live)
    }

    const fn list(&self, kind: ListKind) -> &SlabList {
        &self.lists[kind as usize]
    }

    /// # Safety
    /// `slab` must be a live header of this cache.
    unsafe fn relink(&mut self, slab: *mut SlabHeader, target: ListKind) {
        unsafe {
            let current = (*slab).list;
            if current != target {
                self.lists[current as usize].remove(slab);
                self.lists[target as usize].push(slab);
                (*slab).list = target;
            }
        }
    }

    fn grow<S: PageSource + ?Sized>(&mut self, pages: &S) -> Option<*mut SlabHeader> {
        let (page, base) = pages.alloc_page()?;
        let slab = base.as_ptr().cast::<SlabHeader>();

        // SAFETY: the page is ours; header and cells are laid out within it.
        unsafe {
            let mut free = ptr::null_mut::<Cell>();
            for i in (0..self.per_slab).rev() {
                let cell = base.as_ptr().add(HEADER_BYTES + i * self.stride).cast::<Cell>();
                cell.write(Cell {
                    slab,
                    next_free: free,
                });
                free = cell;
            }
            slab.write(SlabHeader {
                magic: SLAB_MAGIC,
                list: ListKind::Partial,
                object_size: self.object_size as u16,
                free_count: self.per_slab as u16,
                total_count: self.per_slab as u16,
                page,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                free_cells: free,
            });
            self.lists[ListKind::Partial as usize].push(slab);
        }
        debug!(
            "slab[{}]: grew by page {page} ({} objects)",
            self.object_size, self.per_slab
        );
        Some(slab)
    }
}
