//! # Physical Memory Management
//!
//! Page-frame allocation for the kernel: a binary buddy allocator over the
//! usable RAM reported by the boot memory map, and slab caches that carve
//! single buddy pages into fixed-size objects for small kernel structures.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          PhysicalMemoryManager (façade)             │
//! │    • setup from the boot memory map                 │
//! │    • alloc_pages / free_pages                       │
//! │    • slab_alloc<T> / slab_free<T>                   │
//! └──────────┬─────────────────────────────┬────────────┘
//!            │                             │
//! ┌──────────▼──────────┐       ┌──────────▼────────────┐
//! │   SlabCache × N     │──────►│   BuddyAllocator      │
//! │ 16 B .. 1 KiB cells │ pages │ orders 0..=MAX_ORDER  │
//! └─────────────────────┘       └──────────┬────────────┘
//!                                          │
//!                               ┌──────────▼────────────┐
//!                               │      PhysMapper       │
//!                               │   frame → pointer     │
//!                               └───────────────────────┘
//! ```
//!
//! ## Metadata placement
//!
//! Neither allocator needs memory of its own. A free buddy block carries its
//! list links in its first bytes, and every slab page starts with the header
//! describing it. All such headers are reached through a [`PhysMapper`], which
//! turns a [`PhysicalAddress`](kernel_memory_addresses::PhysicalAddress) into a
//! pointer in the current address space. In the kernel that is the direct map
//! ([`HhdmPhysMapper`]); in tests it is [`HostRam`], a plain host allocation
//! standing in for RAM.
//!
//! ## Locking
//!
//! The buddy allocator and each cache sit behind their own interrupt-masking
//! [`SpinLock`](kernel_sync::SpinLock). A cache that needs a fresh page takes
//! the buddy lock while holding its own; nothing takes them the other way
//! round.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "host-ram"))]
extern crate std;

pub mod buddy;
pub mod phys_mapper;
pub mod pmm;
mod raw;
pub mod size_class;
pub mod slab;

pub use buddy::{BuddyAllocator, BuddyError, MAX_ORDER};
#[cfg(any(test, feature = "host-ram"))]
pub use phys_mapper::HostRam;
pub use phys_mapper::{HhdmPhysMapper, PhysMapper};
pub use pmm::{PhysicalMemoryManager, PmmConfig, PmmError, PmmStats};
pub use size_class::SIZE_CLASSES;
pub use slab::{PageSource, SlabCache, SlabError, SlabStats};
