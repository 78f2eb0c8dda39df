use core::ops::{Deref, DerefMut};

/// `IF` bit in `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted (CPL0).
#[cfg(feature = "asm")]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted (CPL0).
#[cfg(feature = "asm")]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[cfg(feature = "asm")]
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Host build: there is no interrupt flag to toggle.
#[cfg(not(feature = "asm"))]
#[inline]
pub const fn cli_stop_interrupts() {}

/// Host build: there is no interrupt flag to toggle.
#[cfg(not(feature = "asm"))]
#[inline]
pub const fn sti_enable_interrupts() {}

/// Host build: reports interrupts as disabled.
#[cfg(not(feature = "asm"))]
#[inline]
#[must_use]
pub const fn rflags() -> u64 {
    0
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, so guards nest.
///
/// ```no_run
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts disabled here if previously enabled
///     // critical section
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// A lock guard paired with an [`IrqGuard`].
///
/// Returned by the `*_irq` lock methods. The lock is released before
/// interrupts are restored.
pub struct IrqLocked<G> {
    // Field order is drop order.
    guard: G,
    _irq: IrqGuard,
}

impl<G> IrqLocked<G> {
    #[inline]
    pub(crate) fn new(irq: IrqGuard, guard: G) -> Self {
        Self { guard, _irq: irq }
    }
}

impl<G: Deref> Deref for IrqLocked<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for IrqLocked<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
