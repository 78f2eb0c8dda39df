//! Halting and fault-address access.

use kernel_memory_addresses::VirtualAddress;

/// Stop this core for good.
#[cfg(feature = "asm")]
pub fn halt_loop() -> ! {
    loop {
        unsafe { core::arch::asm!("cli; hlt", options(nomem, nostack)) }
    }
}

/// Host builds cannot halt; spin instead.
#[cfg(not(feature = "asm"))]
pub fn halt_loop() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Linear address of the most recent page fault.
///
/// # Safety
/// Requires CPL0; only meaningful inside the #PF handler.
#[cfg(feature = "asm")]
#[inline]
#[must_use]
pub unsafe fn read_cr2() -> VirtualAddress {
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    VirtualAddress::new(cr2)
}

/// # Safety
/// No requirements on host builds.
#[cfg(not(feature = "asm"))]
#[inline]
#[must_use]
pub const unsafe fn read_cr2() -> VirtualAddress {
    VirtualAddress::new(0)
}
