use crate::{PageSize, Size4K};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address (RAM or MMIO).
///
/// Carries the *kind* of address at the type level so a frame address is never
/// dereferenced or handed to the MMU as if it were virtual. Conversions to a
/// usable pointer go through a physical mapper, never through a cast.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
    }

    /// Offset of this address inside its page of size `S`.
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

    /// Align up to `S`, `None` if that overflows.
    #[inline]
    #[must_use]
    pub const fn checked_align_up<S: PageSize>(self) -> Option<Self> {
        match self.0.checked_add(S::MASK) {
            Some(v) => Some(Self(v & !S::MASK)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Flip bit `bit` of the address.
    #[inline]
    #[must_use]
    pub const fn flip_bit(self, bit: u32) -> Self {
        Self(self.0 ^ (1 << bit))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance in bytes between two physical addresses.
impl Sub for PhysicalAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(value: PhysicalAddress) -> Self {
        value.0
    }
}

/// Base of a physical page (frame) of size `S`; the low `S::SHIFT` bits are zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize = Size4K> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !S::MASK,
            _size: PhantomData,
        }
    }

    /// The frame starting exactly at `addr`, `None` when unaligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.base)
    }

    /// Address at `offset` bytes into this frame.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < S::SIZE);
        PhysicalAddress(self.base + (offset & S::MASK))
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>(0x{:016X})",
            core::any::type_name::<S>(),
            self.base
        )
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size2M;

    #[test]
    fn page_and_offset() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        assert_eq!(pa.page::<Size4K>().base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(pa.offset::<Size4K>(), 0x42);
        assert_eq!(pa.page::<Size4K>().join(0x42), pa);
        assert_eq!(pa.offset::<Size2M>(), 0x42);
    }

    #[test]
    fn aligned_construction() {
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x3000)).is_some());
        assert!(PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x3001)).is_none());
        assert_eq!(
            PhysicalAddress::new(0x1001).checked_align_up::<Size4K>(),
            Some(PhysicalAddress::new(0x2000))
        );
        assert_eq!(PhysicalAddress::new(u64::MAX).checked_align_up::<Size4K>(), None);
    }

    #[test]
    fn buddy_bit_flip() {
        let a = PhysicalAddress::new(0x4000);
        assert_eq!(a.flip_bit(12), PhysicalAddress::new(0x5000));
        assert_eq!(a.flip_bit(14), PhysicalAddress::new(0x0000));
        assert_eq!(PhysicalAddress::new(0x5000) - a, 0x1000);
    }
}
