//! # Typed `X86_64` Registers and MMU Control
//!
//! The small set of privileged operations the memory core needs: loading and
//! storing `CR3`, reading `CR2`, invalidating TLB entries, and halting.
//!
//! With the `asm` feature these are the real instructions. Without it,
//! `CR3` is a shadow value held in memory and TLB maintenance does nothing,
//! so page-table code can be exercised in host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpu;
pub mod cr3;
pub mod tlb;

pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Storing `CR3` switches the active address space.
    unsafe fn store_unsafe(self);
}
