//! # Kernel Heap and Memory Boot
//!
//! The general-purpose allocator of the kernel and the code that brings the
//! whole memory subsystem up:
//!
//! ```text
//!  boot memory map ──► PhysicalMemoryManager ──► VirtualMemoryManager ──► KernelHeap
//!                      (buddy + slab caches)     (kernel space, heap      (GlobalAlloc)
//!                                                 window in its half)
//! ```
//!
//! * [`KernelHeap`]: best-fit blocks with headers and footers, merged on
//!   free, growing into its window on demand. It implements
//!   [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! * [`HeapBacking`]: where the window's memory comes from.
//!   [`VmmHeapBacking`] maps fresh frames into the kernel space; tests use a
//!   host buffer instead.
//! * [`KernelMemory`]: owns the PMM and VMM, boots them in order, and hands
//!   out a [`KernelContext`].
//!
//! Address spaces, VMAs and page tables never allocate from this heap; they
//! use the PMM's slab caches, which exist before the heap does.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "host-heap"))]
extern crate std;

pub mod backing;
pub mod context;
mod error;
pub mod heap;

#[cfg(any(test, feature = "host-heap"))]
pub use backing::HostHeapBacking;
pub use backing::{HeapBacking, VmmHeapBacking};
pub use context::{BootError, KernelContext, KernelMemory};
pub use error::HeapError;
pub use heap::{HEAP_ALIGN, HeapStats, KernelHeap, MIN_BLOCK};
