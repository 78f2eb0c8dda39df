use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the PML4 table and cache-control flags
/// for PML4 walks.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    __res0: u8,

    /// Bit 3: PWT: Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    __res1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    __res2: u16,
}

impl Cr3 {
    /// CR3 value selecting `pml4` with write-back caching.
    #[must_use]
    pub const fn for_root(pml4: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_base_4k(pml4.base().as_u64() >> 12)
    }

    /// The PML4 frame this value points at.
    #[must_use]
    pub const fn pml4(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(PhysicalAddress::new(self.pml4_base_4k() << 12))
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(feature = "asm"))]
static SHADOW_CR3: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

#[cfg(not(feature = "asm"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        Self::from_bits(SHADOW_CR3.load(core::sync::atomic::Ordering::Acquire))
    }
}

#[cfg(not(feature = "asm"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        SHADOW_CR3.store(self.into_bits(), core::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trips_through_bits() {
        let root = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x0012_3000));
        let cr3 = Cr3::for_root(root);
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        assert_eq!(cr3.pml4(), root);
        assert!(!cr3.pcd());
    }

    #[test]
    fn host_store_is_observable() {
        let root = PhysicalPage::<Size4K>::containing(PhysicalAddress::new(0x0045_6000));
        unsafe {
            Cr3::for_root(root).store_unsafe();
            assert_eq!(Cr3::load_unsafe().pml4(), root);
        }
    }
}
