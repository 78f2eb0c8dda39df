//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! allocators and the page-table code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory or MMIO, never dereferenced directly. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the MMU. |
//!
//! Page sizes are type-level markers implementing [`PageSize`]:
//! [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! A physical address only becomes a pointer through a physical mapper (see
//! `kernel-pmm`), which keeps every conversion between the two spaces in one
//! auditable place.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let frame = pa.page::<Size4K>();
//! assert_eq!(frame.base().as_u64(), 0x0010_2000);
//! assert_eq!(frame.join(pa.offset::<Size4K>()), pa);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{
    PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PageSize, Size1G, Size2M, Size4K, align_down, align_up,
    pages_for,
};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{KERNEL_HALF_START, USER_HALF_END, VirtualAddress, VirtualPage};
