use crate::{PageSize, Size4K};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// First address of the upper (kernel) canonical half.
pub const KERNEL_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// One past the last address of the lower (user) canonical half.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Virtual memory address.
///
/// Like [`PhysicalAddress`](crate::PhysicalAddress) this is a zero-cost tag
/// over `u64`. Canonicality is not enforced on construction; use
/// [`is_canonical`](Self::is_canonical) where it matters.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// assert!(va.is_kernel_half());
/// assert_eq!(va.page::<Size4K>().base().as_u64(), 0xFFFF_FFFF_8000_1000);
/// assert_eq!(va.offset::<Size4K>(), 0x234);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reinterpret as a raw pointer in the current address space.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 < USER_HALF_END || self.0 >= KERNEL_HALF_START
    }

    /// Lower canonical half, reachable from CPL3 if mapped `USER`.
    #[inline]
    #[must_use]
    pub const fn is_user_half(self) -> bool {
        self.0 < USER_HALF_END
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.0 >= KERNEL_HALF_START
    }

    /// Sign-extend bit 47, producing a canonical address.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub const fn canonicalize(value: u64) -> Self {
        Self((((value << 16) as i64) >> 16) as u64)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(value: VirtualAddress) -> Self {
        value.0
    }
}

/// Base of a virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize = Size4K> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::MASK,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        debug_assert!(offset < S::SIZE);
        VirtualAddress(self.base + (offset & S::MASK))
    }

    /// The page directly after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            base: self.base + S::SIZE,
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPage<{}>(0x{:016X})",
            core::any::type_name::<S>(),
            self.base
        )
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves() {
        assert!(VirtualAddress::new(0x1000).is_user_half());
        assert!(VirtualAddress::new(0xFFFF_8880_0000_0000).is_kernel_half());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert_eq!(
            VirtualAddress::canonicalize(0x0000_FF80_0000_0000),
            VirtualAddress::new(0xFFFF_FF80_0000_0000)
        );
        assert_eq!(
            VirtualAddress::canonicalize(0x0000_0000_0040_0000),
            VirtualAddress::new(0x40_0000)
        );
    }

    #[test]
    fn pages_walk_forward() {
        let p = VirtualAddress::new(0x1234).page::<Size4K>();
        assert_eq!(p.base(), VirtualAddress::new(0x1000));
        assert_eq!(p.next().base(), VirtualAddress::new(0x2000));
        assert_eq!(p.join(0x234), VirtualAddress::new(0x1234));
    }
}
