//! Typed views over raw frames.
//!
//! The only place where allocator metadata is conjured out of physical
//! memory. Callers state which address holds which header; the cast itself,
//! and its alignment check, live here.

use crate::PhysMapper;
use kernel_memory_addresses::PhysicalAddress;

/// View the `T` stored at `pa`.
///
/// # Safety
/// `pa` must hold an initialised `T` owned by the calling allocator, and no
/// other reference to it may be live for `'a`.
#[inline]
pub(crate) unsafe fn view<'a, T, M: PhysMapper + ?Sized>(mapper: &M, pa: PhysicalAddress) -> &'a mut T {
    let ptr = mapper.phys_to_ptr(pa).cast::<T>();
    debug_assert!(ptr.is_aligned(), "misaligned header at {pa}");
    unsafe { &mut *ptr }
}

/// Write `value` at `pa` without reading what was there, and return a view of it.
///
/// # Safety
/// `pa` must be memory owned by the calling allocator, large enough for `T`.
#[inline]
pub(crate) unsafe fn place<'a, T, M: PhysMapper + ?Sized>(
    mapper: &M,
    pa: PhysicalAddress,
    value: T,
) -> &'a mut T {
    let ptr = mapper.phys_to_ptr(pa).cast::<T>();
    debug_assert!(ptr.is_aligned(), "misaligned header at {pa}");
    unsafe {
        ptr.write(value);
        &mut *ptr
    }
}
