//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for a single active core. Every lock can be taken in an
//! interrupt-masking variant (`*_irq`), which disables hardware interrupts for
//! the lifetime of the guard and restores the previous state afterwards, so an
//! interrupt handler can never spin on a lock held by the code it preempted.
//!
//! | Type | Use |
//! |------|-----|
//! | [`SpinLock`] | exclusive access (allocators, heap, `current` space) |
//! | [`RwSpinLock`] | many readers or one writer (VMA lists) |
//! | [`SyncOnceCell`] | process-wide singletons initialised once at boot |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod rw_spin_lock;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqLocked};
pub use rw_spin_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
