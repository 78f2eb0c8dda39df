//! # Virtual Memory
//!
//! x86-64 four-level paging for the kernel: page-table entries, address
//! spaces with their areas, the kernel-space builder and the page-fault
//! entry point.
//!
//! ## Translation
//!
//! A canonical 48-bit virtual address splits into four 9-bit table indices
//! and a 12-bit page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  CR3 → PML4 → PDPT → PD → PT → 4 KiB frame
//!                 │      └─── PS=1: 2 MiB leaf
//!                 └────────── PS=1: 1 GiB leaf
//! ```
//!
//! This crate only creates 4 KiB leaves. Larger leaves installed by someone
//! else are still translated by [`AddressSpace::get_physical_address`].
//!
//! ## Address-space layout
//!
//! The lower half (PML4 slots 0..256) is private to each space. The upper
//! half (slots 256..512) is the kernel's, shared by pointing every space's
//! upper PML4 entries at the same PDPTs. Those PDPTs are created when the
//! kernel space is built, so kernel mappings added later are seen by all.
//!
//! ## Frames
//!
//! Page tables, VMA nodes and address-space objects all come from the
//! [`PhysicalMemoryManager`](kernel_pmm::PhysicalMemoryManager), never from
//! the kernel heap, which itself sits on top of this crate.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod address_space;
pub mod entry;
mod error;
pub mod fault;
pub mod layout;
pub mod table;
#[cfg(test)]
mod test_support;
pub mod vma;
pub mod vmm;

pub use address_space::{AddressSpace, SpaceRef};
pub use entry::{PageFlags, PageTableEntry};
pub use error::VmmError;
pub use fault::{
    FaultCause, PageFaultError, PageFaultReport, diagnose_page_fault, handle_page_fault,
    handle_page_fault_from_cr2,
};
pub use layout::{KernelImage, KernelLayout};
pub use table::PageTable;
pub use vma::{BackingRef, Vma, VmaFlags, VmaKind};
pub use vmm::VirtualMemoryManager;

/// Re-export constants as info module.
pub use kernel_info::memory as info;
