//! TLB maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Invalidate the translation for the page containing `va` on this CPU.
///
/// # Safety
/// Requires CPL0.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Flush all non-global translations by reloading CR3.
///
/// # Safety
/// Requires CPL0.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

/// # Safety
/// No requirements on host builds.
#[cfg(not(feature = "asm"))]
#[inline]
pub const unsafe fn invlpg(_va: VirtualAddress) {}

/// # Safety
/// No requirements on host builds.
#[cfg(not(feature = "asm"))]
#[inline]
pub const unsafe fn flush_all() {}
