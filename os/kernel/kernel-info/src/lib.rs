//! # Kernel Memory Configuration and Boot Interface
//!
//! Layout constants shared by every memory-management crate and the boot
//! memory map the physical allocator is seeded from.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │           User Space            │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │     (non-canonical hole)        │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  Direct map (DIRECT_MAP_BYTES)  │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel heap (up to 1 GiB)      │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │     Kernel Text & Data          │
//! MMIO_BASE             ├─────────────────────────────────┤ 0xffff_ffff_f000_0000
//!                       │  Device windows (VGA, ...)      │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Compile-time assertions in [`memory`] keep the windows disjoint.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//!             │  (BIOS, VGA 0xA0000..0xC0000)   │
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤
//!             │    Available RAM                │
//!             │  (Managed by the buddy system)  │
//!             └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
