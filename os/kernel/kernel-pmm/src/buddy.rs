//! # Binary Buddy Allocator
//!
//! Physical memory is managed in blocks of `2^order` pages, `order` in
//! `0..=MAX_ORDER`. A block of order *k* always starts at an address aligned
//! to `2^k` pages, so the address of its buddy (the other half of the order
//! *k+1* block both came from) is found by flipping bit `k + PAGE_SHIFT`.
//!
//! Each order has a doubly-linked free list threaded through the free blocks
//! themselves:
//!
//! ```text
//! heads[k] ──► ┌────────────┐ next ┌────────────┐
//!              │ FreeBlock  ├─────►│ FreeBlock  ├──► NIL
//!      NIL ◄───┤ magic,order│◄─────┤            │
//!         prev │ this       │ prev │            │
//!              ├────────────┤      ├────────────┤
//!              │  2^k pages │      │  2^k pages │
//!              └────────────┘      └────────────┘
//! ```
//!
//! Links are physical addresses; headers are reached through a
//! [`PhysMapper`]. A header is only present while its block is free and is
//! cleared when the block is handed out or merged away.

use crate::PhysMapper;
use crate::raw::{place, view};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_down, align_up};
use log::{debug, trace, warn};

/// Largest order handed out: `2^10` pages, 4 MiB.
pub const MAX_ORDER: usize = 10;

/// Number of disjoint physical ranges the allocator can manage.
pub const MAX_REGIONS: usize = 64;

const ORDERS: usize = MAX_ORDER + 1;
const NIL: u64 = u64::MAX;
const FREE_MAGIC: u32 = 0xB0DD_F4EE;

/// Bytes in a block of `order`.
#[inline]
#[must_use]
pub const fn block_bytes(order: usize) -> u64 {
    PAGE_SIZE << order
}

/// Smallest order whose block holds `pages` pages.
#[inline]
#[must_use]
pub const fn order_for_pages(pages: usize) -> usize {
    if pages <= 1 {
        0
    } else {
        pages.next_power_of_two().trailing_zeros() as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    #[error("order {0} exceeds the maximum order")]
    InvalidOrder(usize),
    #[error("block at {0} is not aligned to its order")]
    Misaligned(PhysicalAddress),
    #[error("block at {0} lies outside managed memory")]
    Unmanaged(PhysicalAddress),
    #[error("block at {0} is already free")]
    DoubleFree(PhysicalAddress),
}

/// Header written at the start of every free block.
#[repr(C)]
struct FreeBlock {
    magic: u32,
    order: u8,
    free: bool,
    /// Physical address of this block; guards against stale or misplaced headers.
    this: u64,
    prev: u64,
    next: u64,
}

#[derive(Copy, Clone, Debug)]
struct Region {
    start: u64,
    end: u64,
}

impl Region {
    const EMPTY: Self = Self { start: 0, end: 0 };

    const fn contains(&self, start: u64, len: u64) -> bool {
        start >= self.start && start + len <= self.end
    }

    const fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end && self.start < end
    }
}

/// Power-of-two page allocator.
///
/// The allocator never touches memory except through the mapper passed to
/// each call, and never owns that mapper; the caller keeps it alive and
/// consistent across calls.
pub struct BuddyAllocator {
    heads: [u64; ORDERS],
    lengths: [usize; ORDERS],
    regions: [Region; MAX_REGIONS],
    region_count: usize,
    total_pages: usize,
    free_pages: usize,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [NIL; ORDERS],
            lengths: [0; ORDERS],
            regions: [Region::EMPTY; MAX_REGIONS],
            region_count: 0,
            total_pages: 0,
            free_pages: 0,
        }
    }

    /// Hand `[base, base + length)` to the allocator.
    ///
    /// The range is shrunk to whole pages, then carved front to back into the
    /// largest blocks that are both aligned and fit. Returns the number of
    /// pages added; ranges overlapping managed memory are ignored.
    ///
    /// # Safety
    /// The range must be unused RAM reachable through `mapper`, and must stay
    /// reachable for as long as the allocator is used with it.
    pub unsafe fn add_region<M: PhysMapper + ?Sized>(
        &mut self,
        mapper: &M,
        base: u64,
        length: u64,
    ) -> usize {
        let start = align_up(base, PAGE_SIZE);
        let end = align_down(base.saturating_add(length), PAGE_SIZE);
        if end <= start {
            return 0;
        }

        if self.regions[..self.region_count]
            .iter()
            .any(|r| r.overlaps(start, end))
        {
            warn!("ignoring physical range {start:#x}..{end:#x}: overlaps managed memory");
            return 0;
        }
        if self.region_count == MAX_REGIONS {
            warn!("ignoring physical range {start:#x}..{end:#x}: region table full");
            return 0;
        }
        self.regions[self.region_count] = Region { start, end };
        self.region_count += 1;

        let mut cur = start;
        while cur < end {
            let mut order = MAX_ORDER;
            while order > 0 && (cur % block_bytes(order) != 0 || cur + block_bytes(order) > end) {
                order -= 1;
            }
            unsafe { self.push(mapper, cur, order) };
            cur += block_bytes(order);
        }

        let pages = ((end - start) / PAGE_SIZE) as usize;
        self.total_pages += pages;
        self.free_pages += pages;
        debug!("buddy: added {start:#x}..{end:#x} ({pages} pages)");
        pages
    }

    /// Allocate a block of exactly `2^order` pages.
    ///
    /// Takes from the matching free list if possible, otherwise splits the
    /// smallest larger block, returning every unused upper half to the list of
    /// its order.
    pub fn alloc<M: PhysMapper + ?Sized>(&mut self, mapper: &M, order: usize) -> Option<PhysicalAddress> {
        if order > MAX_ORDER {
            return None;
        }
        let found = (order..ORDERS).find(|&o| self.heads[o] != NIL)?;
        let block = self.heads[found];

        // SAFETY: list members are free blocks inside managed regions.
        unsafe {
            self.unlink(mapper, block, found);
            let mut cur = found;
            while cur > order {
                cur -= 1;
                let upper = PhysicalAddress::new(block).flip_bit(cur as u32 + PAGE_SHIFT);
                self.push(mapper, upper.as_u64(), cur);
            }
        }

        self.free_pages -= 1 << order;
        trace!("buddy: alloc order {order} -> {block:#x} (split from {found})");
        Some(PhysicalAddress::new(block))
    }

    /// Return a block obtained from [`alloc`](Self::alloc) with the same order.
    ///
    /// Merges with the buddy as long as it is free and of the same order and
    /// the merged block stays within the region both came from.
    ///
    /// # Errors
    /// Rejects orders above [`MAX_ORDER`], blocks not aligned to their order,
    /// blocks outside managed memory, and blocks that are already free.
    pub fn free<M: PhysMapper + ?Sized>(
        &mut self,
        mapper: &M,
        addr: PhysicalAddress,
        order: usize,
    ) -> Result<(), BuddyError> {
        if order > MAX_ORDER {
            return Err(BuddyError::InvalidOrder(order));
        }
        let pa = addr.as_u64();
        if pa % block_bytes(order) != 0 {
            return Err(BuddyError::Misaligned(addr));
        }
        let region = self
            .region_of(pa, block_bytes(order))
            .ok_or(BuddyError::Unmanaged(addr))?;
        // SAFETY: `pa` is inside a managed region.
        let already_free = unsafe {
            self.is_free_header(mapper, pa, None) || self.inside_free_block(mapper, region, pa, order)
        };
        if already_free {
            return Err(BuddyError::DoubleFree(addr));
        }

        let mut block = pa;
        let mut cur = order;
        while cur < MAX_ORDER {
            let buddy = PhysicalAddress::new(block).flip_bit(cur as u32 + PAGE_SHIFT).as_u64();
            let merged = block.min(buddy);
            if !region.contains(merged, block_bytes(cur + 1)) {
                break;
            }
            // SAFETY: the buddy lies inside the same region.
            unsafe {
                if !self.is_free_header(mapper, buddy, Some(cur)) {
                    break;
                }
                self.unlink(mapper, buddy, cur);
            }
            block = merged;
            cur += 1;
        }

        // SAFETY: the caller returned this block; it is inside `region`.
        unsafe { self.push(mapper, block, cur) };
        self.free_pages += 1 << order;
        trace!("buddy: free {pa:#x} order {order} -> merged to order {cur} at {block:#x}");
        Ok(())
    }

    /// Pages currently free.
    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Pages ever handed to the allocator.
    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Free blocks on the list of `order`.
    #[inline]
    #[must_use]
    pub const fn free_blocks(&self, order: usize) -> usize {
        if order > MAX_ORDER { 0 } else { self.lengths[order] }
    }

    /// Largest order with a free block.
    #[must_use]
    pub fn largest_free_order(&self) -> Option<usize> {
        (0..ORDERS).rev().find(|&o| self.heads[o] != NIL)
    }

    /// Whether `[addr, addr + bytes)` lies inside one managed region.
    #[must_use]
    pub fn manages(&self, addr: PhysicalAddress, bytes: u64) -> bool {
        self.region_of(addr.as_u64(), bytes).is_some()
    }

    /// Walk every free list, checking links and headers, and count free pages.
    ///
    /// Returns `None` if a list is inconsistent with its recorded length.
    #[must_use]
    pub fn count_free_pages<M: PhysMapper + ?Sized>(&self, mapper: &M) -> Option<usize> {
        let mut pages = 0;
        for order in 0..ORDERS {
            let mut seen = 0;
            let mut prev = NIL;
            let mut cur = self.heads[order];
            while cur != NIL {
                // SAFETY: list members are free blocks inside managed regions.
                let h = unsafe { view::<FreeBlock, _>(mapper, PhysicalAddress::new(cur)) };
                if h.magic != FREE_MAGIC || usize::from(h.order) != order || h.prev != prev {
                    return None;
                }
                seen += 1;
                prev = cur;
                cur = h.next;
            }
            if seen != self.lengths[order] {
                return None;
            }
            pages += seen << order;
        }
        Some(pages)
    }

    fn region_of(&self, start: u64, len: u64) -> Option<Region> {
        self.regions[..self.region_count]
            .iter()
            .copied()
            .find(|r| r.contains(start, len))
    }

    /// # Safety
    /// `pa` must be inside a managed region.
    unsafe fn is_free_header<M: PhysMapper + ?Sized>(&self, mapper: &M, pa: u64, order: Option<usize>) -> bool {
        let h = unsafe { view::<FreeBlock, _>(mapper, PhysicalAddress::new(pa)) };
        h.magic == FREE_MAGIC
            && h.free
            && h.this == pa
            && order.is_none_or(|o| usize::from(h.order) == o)
    }

    /// Whether a free block of higher order than `order` covers `pa`.
    ///
    /// # Safety
    /// `region` must be managed.
    unsafe fn inside_free_block<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        region: Region,
        pa: u64,
        order: usize,
    ) -> bool {
        ((order + 1)..ORDERS).any(|k| {
            let start = align_down(pa, block_bytes(k));
            // SAFETY: `start` is inside `region`.
            region.contains(start, block_bytes(k)) && unsafe { self.is_free_header(mapper, start, Some(k)) }
        })
    }

    /// # Safety
    /// `pa` must be an unlinked block of `order` inside a managed region.
    unsafe fn push<M: PhysMapper + ?Sized>(&mut self, mapper: &M, pa: u64, order: usize) {
        let head = self.heads[order];
        unsafe {
            place(
                mapper,
                PhysicalAddress::new(pa),
                FreeBlock {
                    magic: FREE_MAGIC,
                    order: order as u8,
                    free: true,
                    this: pa,
                    prev: NIL,
                    next: head,
                },
            );
            if head != NIL {
                view::<FreeBlock, _>(mapper, PhysicalAddress::new(head)).prev = pa;
            }
        }
        self.heads[order] = pa;
        self.lengths[order] += 1;
    }

    /// # Safety
    /// `pa` must be a member of the free list of `order`.
    unsafe fn unlink<M: PhysMapper + ?Sized>(&mut self, mapper: &M, pa: u64, order: usize) {
        let h = unsafe { view::<FreeBlock, _>(mapper, PhysicalAddress::new(pa)) };
        let (prev, next) = (h.prev, h.next);
        h.magic = 0;
        h.free = false;
        h.this = NIL;
        unsafe {
            if prev == NIL {
                self.heads[order] = next;
            } else {
                view::<FreeBlock, _>(mapper, PhysicalAddress::new(prev)).next = next;
            }
            if next != NIL {
                view::<FreeBlock, _>(mapper, PhysicalAddress::new(next)).prev = prev;
            }
        }
        self.lengths[order] -= 1;
    }
}
