//! # Kernel Heap
//!
//! A best-fit allocator over one contiguous virtual window that grows on
//! demand. Every block, used or free, carries a header and a footer, and the
//! blocks tile the mapped part of the window without gaps:
//!
//! ```text
//! base                                                           base + mapped
//! ┌────────┬──────────────┬────────┬────────┬─────────┬────────┬───────
//! │ Header │   payload    │ Footer │ Header │ payload │ Footer │ ...
//! └────────┴──────────────┴────────┴────────┴─────────┴────────┴───────
//!  32 B     multiple of 16  16 B
//! ```
//!
//! The footer lets [`free`](KernelHeap::free) find the block before it, so
//! both neighbors are merged immediately and no two free blocks are ever
//! adjacent. Free blocks are additionally threaded on a doubly linked list
//! through their headers.
//!
//! When no free block fits, the heap asks its [`HeapBacking`] for more
//! memory at the end of the window, up to the backing's ceiling.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_sync::SpinLock;
use log::{debug, error, info, warn};

use crate::backing::HeapBacking;
use crate::error::HeapError;

/// Alignment of every block and payload.
pub const HEAP_ALIGN: usize = 16;

const HEADER: usize = size_of::<Header>();
const FOOTER: usize = size_of::<Footer>();
const MIN_PAYLOAD: usize = 16;

/// Smallest block that can exist on its own.
pub const MIN_BLOCK: usize = HEADER + FOOTER + MIN_PAYLOAD;

/// The heap grows by at least this much at a time.
const GROW_STEP: usize = 64 * 1024;

const HEADER_MAGIC: u32 = 0x4b48_4541;
const FOOTER_MAGIC: u64 = 0x4b48_4541_4646_5452;

#[repr(C)]
struct Header {
    /// Whole block, header and footer included.
    size: usize,
    magic: u32,
    used: bool,
    prev_free: *mut Header,
    next_free: *mut Header,
}

#[repr(C)]
struct Footer {
    size: usize,
    magic: u64,
}

const _: () = assert!(HEADER == 32 && FOOTER == 16);
const _: () = assert!(HEADER % HEAP_ALIGN == 0 && FOOTER % HEAP_ALIGN == 0);

/// Occupancy of the heap, gathered by walking every block.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes of the window currently backed by memory.
    pub total_bytes: usize,
    /// Bytes in used blocks, their headers and footers included.
    pub used_bytes: usize,
    /// Bytes in free blocks, their headers and footers included.
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Payload bytes of the largest free block.
    pub largest_free: usize,
}

#[inline]
const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Block size serving a payload of `size` bytes.
fn block_size_for(size: usize) -> Result<usize, HeapError> {
    size.max(1)
        .checked_add(HEAP_ALIGN - 1 + HEADER + FOOTER)
        .map(|s| s & !(HEAP_ALIGN - 1))
        .ok_or(HeapError::InvalidLayout)
}

/// The mutable part, only reached under the heap lock.
struct Heap<B> {
    backing: B,
    base: usize,
    mapped: usize,
    max: usize,
    free: *mut Header,
}

// Safety: the raw pointers all point into the heap window owned by `backing`.
unsafe impl<B: Send> Send for Heap<B> {}

impl<B: HeapBacking> Heap<B> {
    const fn end(&self) -> usize {
        self.base + self.mapped
    }

    /// Format `[addr, addr + size)` as a block. The free links are cleared.
    unsafe fn write_block(addr: usize, size: usize, used: bool) -> *mut Header {
        let h = addr as *mut Header;
        unsafe {
            h.write(Header {
                size,
                magic: HEADER_MAGIC,
                used,
                prev_free: null_mut(),
                next_free: null_mut(),
            });
            ((addr + size - FOOTER) as *mut Footer).write(Footer {
                size,
                magic: FOOTER_MAGIC,
            });
        }
        h
    }

    unsafe fn push_free(&mut self, h: *mut Header) {
        unsafe {
            (*h).prev_free = null_mut();
            (*h).next_free = self.free;
            if !self.free.is_null() {
                (*self.free).prev_free = h;
            }
        }
        self.free = h;
    }

    unsafe fn unlink(&mut self, h: *mut Header) {
        unsafe {
            let (prev, next) = ((*h).prev_free, (*h).next_free);
            if prev.is_null() {
                self.free = next;
            } else {
                (*prev).next_free = next;
            }
            if !next.is_null() {
                (*next).prev_free = prev;
            }
        }
    }

    /// The free block starting at `addr`, if there is one.
    unsafe fn free_at(&self, addr: usize) -> Option<*mut Header> {
        let h = addr as *mut Header;
        (addr < self.end() && unsafe { !(*h).used }).then_some(h)
    }

    /// The free block ending right before `addr`, if there is one.
    unsafe fn free_before(&self, addr: usize) -> Option<*mut Header> {
        if addr <= self.base {
            return None;
        }
        let footer = unsafe { &*((addr - FOOTER) as *const Footer) };
        debug_assert_eq!(footer.magic, FOOTER_MAGIC);
        let h = (addr - footer.size) as *mut Header;
        unsafe { (!(*h).used).then_some(h) }
    }

    /// Mark a used header as gone before its block is released, so a stale
    /// copy left inside a merged block never validates.
    unsafe fn retire(h: *mut Header) {
        unsafe {
            (*h).used = false;
            (*h).magic = 0;
        }
    }

    /// Turn `[addr, addr + size)` into a free block, merged with free
    /// neighbors, and put it on the free list.
    unsafe fn release(&mut self, mut addr: usize, mut size: usize) {
        unsafe {
            if let Some(next) = self.free_at(addr + size) {
                self.unlink(next);
                size += (*next).size;
            }
            if let Some(prev) = self.free_before(addr) {
                self.unlink(prev);
                addr = prev as usize;
                size += (*prev).size;
            }
            let h = Self::write_block(addr, size, false);
            self.push_free(h);
        }
    }

    /// Bytes in front of the payload `h` needs to skip for `align`, if the
    /// block can hold `needed` bytes at that alignment.
    ///
    /// A non-zero lead becomes a free block of its own, so it is never
    /// smaller than [`MIN_BLOCK`].
    unsafe fn fit(h: *mut Header, needed: usize, align: usize) -> Option<usize> {
        Self::fit_at(h as usize, unsafe { (*h).size }, needed, align)
    }

    fn fit_at(start: usize, size: usize, needed: usize, align: usize) -> Option<usize> {
        let end = start.checked_add(size)?;
        let mut payload = align_up(start + HEADER, align)?;
        if payload - HEADER != start && payload - HEADER - start < MIN_BLOCK {
            payload = align_up(start + HEADER + MIN_BLOCK, align)?;
        }
        let block_end = (payload - HEADER).checked_add(needed)?;
        (block_end <= end).then_some(payload - HEADER - start)
    }

    /// Smallest free block that fits.
    unsafe fn best_fit(&self, needed: usize, align: usize) -> Option<(*mut Header, usize)> {
        let mut best: Option<(*mut Header, usize, usize)> = None;
        let mut h = self.free;
        while !h.is_null() {
            let size = unsafe { (*h).size };
            if let Some(lead) = unsafe { Self::fit(h, needed, align) }
                && best.is_none_or(|(_, _, s)| size < s)
            {
                best = Some((h, lead, size));
            }
            h = unsafe { (*h).next_free };
        }
        best.map(|(h, lead, _)| (h, lead))
    }

    /// Take `needed` bytes from free block `h`, `lead` bytes in.
    unsafe fn carve(&mut self, h: *mut Header, lead: usize, needed: usize) -> NonNull<u8> {
        unsafe {
            self.unlink(h);
            let mut block = h as usize;
            let mut size = (*h).size;
            if lead > 0 {
                let front = Self::write_block(block, lead, false);
                self.push_free(front);
                block += lead;
                size -= lead;
            }
            if size - needed >= MIN_BLOCK {
                let tail = Self::write_block(block + needed, size - needed, false);
                self.push_free(tail);
                size = needed;
            }
            Self::write_block(block, size, true);
            NonNull::new_unchecked((block + HEADER) as *mut u8)
        }
    }

    /// Extend the window until the block at its end spans `required` bytes.
    ///
    /// A free block already at the end counts toward `required`, since the
    /// new range merges with it.
    fn grow(&mut self, required: usize) -> Result<(), HeapError> {
        let tail = unsafe { self.free_before(self.end()) }.map_or(0, |h| unsafe { (*h).size });
        let shortfall = required.saturating_sub(tail).max(1);
        let want = align_up(shortfall.max(GROW_STEP), PAGE_SIZE as usize).unwrap_or(usize::MAX);
        let bytes = want.min(self.max - self.mapped);
        if bytes < shortfall {
            warn!(
                "heap: cannot grow by {required:#x} bytes, {:#x} of {:#x} mapped",
                self.mapped, self.max
            );
            return Err(HeapError::OutOfMemory);
        }
        self.backing.map(self.mapped, bytes)?;
        let start = self.end();
        self.mapped += bytes;
        unsafe { self.release(start, bytes) };
        debug!("heap: grown by {bytes:#x} to {:#x} bytes", self.mapped);
        Ok(())
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidLayout);
        }
        if align > self.max {
            return Err(HeapError::OutOfMemory);
        }
        let align = align.max(HEAP_ALIGN);
        let needed = block_size_for(size)?;
        if let Some((h, lead)) = unsafe { self.best_fit(needed, align) } {
            return Ok(unsafe { self.carve(h, lead, needed) });
        }
        let slack = if align > HEAP_ALIGN { align + MIN_BLOCK } else { 0 };
        self.grow(needed.checked_add(slack).ok_or(HeapError::InvalidLayout)?)?;
        let (h, lead) = unsafe { self.best_fit(needed, align) }.ok_or(HeapError::OutOfMemory)?;
        Ok(unsafe { self.carve(h, lead, needed) })
    }

    /// Header of the used block whose payload starts at `ptr`.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<*mut Header, HeapError> {
        let p = ptr.as_ptr() as usize;
        if p % HEAP_ALIGN != 0 || p < self.base + HEADER || p >= self.end() {
            return Err(HeapError::InvalidPointer);
        }
        let h = (p - HEADER) as *mut Header;
        let header = unsafe { &*h };
        let size = header.size;
        if header.magic != HEADER_MAGIC
            || !header.used
            || size < MIN_BLOCK
            || size % HEAP_ALIGN != 0
            || size > self.end() - h as usize
        {
            return Err(HeapError::InvalidPointer);
        }
        let footer = unsafe { &*((h as usize + size - FOOTER) as *const Footer) };
        if footer.magic != FOOTER_MAGIC || footer.size != size {
            return Err(HeapError::InvalidPointer);
        }
        Ok(h)
    }

    fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let h = self.block_of(ptr)?;
        unsafe {
            Self::retire(h);
            self.release(h as usize, (*h).size);
        }
        Ok(())
    }

    fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let h = self.block_of(ptr)?;
        let needed = block_size_for(new_size)?;
        let block = h as usize;
        let size = unsafe { (*h).size };

        let available = match unsafe { self.free_at(block + size) } {
            _ if needed <= size => size,
            Some(next) if size + unsafe { (*next).size } >= needed => unsafe {
                self.unlink(next);
                size + (*next).size
            },
            _ => {
                let fresh = self.alloc(new_size, align)?;
                let keep = (size - HEADER - FOOTER).min(new_size);
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), keep);
                    Self::retire(h);
                    self.release(block, size);
                }
                return Ok(fresh);
            }
        };

        unsafe {
            if available - needed >= MIN_BLOCK {
                Self::write_block(block, needed, true);
                self.release(block + needed, available - needed);
            } else {
                Self::write_block(block, available, true);
            }
        }
        Ok(ptr)
    }

    fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total_bytes: self.mapped,
            ..HeapStats::default()
        };
        let mut addr = self.base;
        while addr < self.end() {
            let h = unsafe { &*(addr as *const Header) };
            if h.used {
                stats.used_bytes += h.size;
                stats.used_blocks += 1;
            } else {
                stats.free_bytes += h.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(h.size - HEADER - FOOTER);
            }
            addr += h.size;
        }
        stats
    }

    /// Panic unless the blocks tile the window, no two free blocks touch,
    /// and the free list holds exactly the free blocks.
    #[cfg(test)]
    fn check(&self) {
        let mut addr = self.base;
        let mut previous_free = false;
        let mut free_blocks = 0;
        while addr < self.end() {
            let h = unsafe { &*(addr as *const Header) };
            let f = unsafe { &*((addr + h.size - FOOTER) as *const Footer) };
            assert_eq!(h.magic, HEADER_MAGIC, "header at {addr:#x}");
            assert_eq!((f.magic, f.size), (FOOTER_MAGIC, h.size), "footer of {addr:#x}");
            assert!(!(previous_free && !h.used), "adjacent free blocks at {addr:#x}");
            previous_free = !h.used;
            free_blocks += usize::from(!h.used);
            addr += h.size;
        }
        assert_eq!(addr, self.end());
        let mut listed = 0;
        let mut h = self.free;
        while !h.is_null() {
            assert!(unsafe { !(*h).used });
            listed += 1;
            h = unsafe { (*h).next_free };
        }
        assert_eq!(listed, free_blocks);
    }
}

/// The kernel heap: one window, one lock.
///
/// Created empty in a `static`, usable after [`setup`](Self::setup).
pub struct KernelHeap<B> {
    state: SpinLock<Option<Heap<B>>>,
}

impl<B> Default for KernelHeap<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> KernelHeap<B> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(None),
        }
    }
}

impl<B: HeapBacking> KernelHeap<B> {
    /// Map the backing's initial range and make it one free block.
    ///
    /// # Errors
    /// [`HeapError::AlreadyInitialized`] on a second call,
    /// [`HeapError::InvalidLayout`] if the backing's window is misaligned or
    /// smaller than its initial size, or whatever mapping the initial range
    /// returns.
    pub fn setup(&self, mut backing: B) -> Result<(), HeapError> {
        let mut state = self.state.lock_irq();
        if state.is_some() {
            return Err(HeapError::AlreadyInitialized);
        }
        let base = backing.base() as usize;
        let (initial, max) = (backing.initial_len(), backing.max_len());
        let page = PAGE_SIZE as usize;
        if base % page != 0 || initial % page != 0 || max % page != 0 || initial == 0 || initial > max {
            error!("heap: unusable window {base:#x}, initial {initial:#x}, max {max:#x}");
            return Err(HeapError::InvalidLayout);
        }
        backing.map(0, initial)?;
        let mut heap = Heap {
            backing,
            base,
            mapped: initial,
            max,
            free: null_mut(),
        };
        unsafe { heap.release(base, initial) };
        *state = Some(heap);
        info!("heap: {initial:#x} bytes at {base:#x}, may grow to {max:#x}");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock_irq().is_some()
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<B>) -> Result<R, HeapError>) -> Result<R, HeapError> {
        let mut state = self.state.lock_irq();
        f(state.as_mut().ok_or(HeapError::NotInitialized)?)
    }

    /// At least `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// [`HeapError::InvalidLayout`] if `align` is not a power of two,
    /// [`HeapError::OutOfMemory`] if the heap cannot grow far enough.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.alloc(size, align))
    }

    /// Return a block to the heap.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] if `ptr` is not the payload of a used
    /// block, which includes freeing twice. Nothing changes in that case.
    ///
    /// # Safety
    /// Nothing may use the payload at `ptr` afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.with_heap(|heap| heap.free(ptr))
            .inspect_err(|e| warn!("heap: free {ptr:p}: {e}"))
    }

    /// Resize the block at `ptr`, moving it only if it can grow in place.
    ///
    /// # Errors
    /// As [`free`](Self::free) for a bad `ptr`, as [`alloc`](Self::alloc) if
    /// a move is needed and fails. The old block stays valid on error.
    ///
    /// # Safety
    /// On success `ptr` must no longer be used unless it was returned.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.realloc(ptr, new_size, HEAP_ALIGN))
    }

    /// # Errors
    /// [`HeapError::NotInitialized`] before [`setup`](Self::setup).
    pub fn get_stats(&self) -> Result<HeapStats, HeapError> {
        self.with_heap(|heap| Ok(heap.stats()))
    }

    #[cfg(test)]
    fn check(&self) {
        self.with_heap(|heap| {
            heap.check();
            Ok(())
        })
        .unwrap();
    }
}

unsafe impl<B: HeapBacking + Send> GlobalAlloc for KernelHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::alloc(self, layout.size(), layout.align()).map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let _ = unsafe { Self::free(self, ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return null_mut();
        };
        self.with_heap(|heap| heap.realloc(ptr, new_size, layout.align()))
            .map_or(null_mut(), NonNull::as_ptr)
    }
}
