//! # Page Faults
//!
//! The exception collaborator calls [`handle_page_fault`] with `CR2` and the
//! error code pushed by the CPU. There is no demand paging: every fault is
//! reported and the core halts. [`diagnose_page_fault`] builds the report on
//! its own, for callers that want to decide differently.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::PhysMapper;
use kernel_registers::cpu::{halt_loop, read_cr2};
use log::error;

use crate::address_space::AddressSpace;
use crate::entry::PageFlags;
use crate::vma::Vma;
use crate::vmm::VirtualMemoryManager;

/// The error code of vector 14.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// The page was present; the fault is a protection violation.
    pub present: bool,
    pub write: bool,
    /// The access came from CPL 3.
    pub user: bool,
    /// A reserved bit was set in some paging entry.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(8)]
    __res0: u8,
    pub sgx: bool,
    #[bits(48)]
    __res1: u64,
}

/// Why the translation failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultCause {
    NotPresent,
    ProtectionViolation,
    ReservedBit,
}

impl PageFaultError {
    #[must_use]
    pub const fn cause(self) -> FaultCause {
        if self.reserved_bit() {
            FaultCause::ReservedBit
        } else if self.present() {
            FaultCause::ProtectionViolation
        } else {
            FaultCause::NotPresent
        }
    }

    const fn access(self) -> &'static str {
        if self.instruction_fetch() {
            "execute"
        } else if self.write() {
            "write"
        } else {
            "read"
        }
    }
}

/// What the faulting space knows about the address.
#[derive(Debug, Copy, Clone)]
pub struct PageFaultReport {
    pub address: VirtualAddress,
    pub error: PageFaultError,
    /// The area containing the address.
    pub area: Option<Vma>,
    /// The translation the tables currently hold.
    pub mapping: Option<(PhysicalAddress, PageFlags)>,
    /// False if a lock held by the interrupted code kept part of the
    /// lookup from running.
    pub complete: bool,
}

impl fmt::Display for PageFaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault: {} {} access at {}, {:?}",
            if self.error.user() { "user" } else { "kernel" },
            self.error.access(),
            self.address,
            self.error.cause(),
        )?;
        match self.area {
            Some(vma) => write!(f, ", in {vma:?}")?,
            None => write!(f, ", outside any area")?,
        }
        match self.mapping {
            Some((pa, flags)) => write!(f, ", mapped to {pa} {flags:?}")?,
            None => write!(f, ", not mapped")?,
        }
        if !self.complete {
            write!(f, " (lookup incomplete)")?;
        }
        Ok(())
    }
}

/// Gather what `space` knows about a fault at `address`.
///
/// Locks of `space` held by the faulting code are not waited for.
#[must_use]
pub fn diagnose_page_fault<M: PhysMapper>(
    space: &AddressSpace<'_, M>,
    address: VirtualAddress,
    error_code: u64,
) -> PageFaultReport {
    let area = space.try_find_vma(address);
    let mapping = space.try_translate(address);
    PageFaultReport {
        address,
        error: PageFaultError::from_bits(error_code),
        complete: area.is_some() && mapping.is_some(),
        area: area.flatten(),
        mapping: mapping.flatten(),
    }
}

/// Report a fault against the current space and halt.
pub fn handle_page_fault<M: PhysMapper>(
    vmm: &VirtualMemoryManager<'_, M>,
    address: VirtualAddress,
    error_code: u64,
) -> ! {
    match vmm.try_current_address_space() {
        Some(space) => error!("{}", diagnose_page_fault(&space, address, error_code)),
        None => error!(
            "page fault at {address}, {:?} (address space busy)",
            PageFaultError::from_bits(error_code).cause()
        ),
    }
    halt_loop()
}

/// [`handle_page_fault`] for the faulting address still held in `CR2`.
///
/// # Safety
/// Must run in ring 0 from the #PF handler, before anything can fault again.
pub unsafe fn handle_page_fault_from_cr2<M: PhysMapper>(vmm: &VirtualMemoryManager<'_, M>, error_code: u64) -> ! {
    handle_page_fault(vmm, unsafe { read_cr2() }, error_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pmm;
    use crate::vma::{VmaFlags, VmaKind};
    use std::string::ToString;

    #[test]
    fn error_code_bits() {
        let e = PageFaultError::from_bits(0b1_0111);
        assert!(e.present() && e.write() && e.user() && e.instruction_fetch());
        assert!(!e.reserved_bit());
        assert_eq!(e.cause(), FaultCause::ProtectionViolation);
        assert_eq!(PageFaultError::from_bits(0).cause(), FaultCause::NotPresent);
        assert_eq!(PageFaultError::from_bits(0b1001).cause(), FaultCause::ReservedBit);
        assert!(PageFaultError::from_bits(1 << 15).sgx());
    }

    #[test]
    fn report_describes_area_and_mapping() {
        let pmm = pmm(256 * 1024);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let space = AddressSpace::new_user(&kernel).unwrap();
        space
            .map_anonymous(
                VirtualAddress::new(0x1000),
                VirtualAddress::new(0x2000),
                VmaFlags::READ,
                VmaKind::Anonymous,
            )
            .unwrap();

        let write = diagnose_page_fault(&space, VirtualAddress::new(0x1008), 0b111);
        assert!(write.complete);
        assert_eq!(write.area.unwrap().start.as_u64(), 0x1000);
        let (_, flags) = write.mapping.unwrap();
        assert!(!flags.contains(PageFlags::WRITABLE));
        let text = write.to_string();
        assert!(text.contains("user write access"), "{text}");
        assert!(text.contains("ProtectionViolation"), "{text}");

        let stray = diagnose_page_fault(&space, VirtualAddress::new(0x8000), 0b100);
        assert!(stray.area.is_none() && stray.mapping.is_none());
        assert!(stray.to_string().contains("outside any area"));
    }

    #[test]
    fn busy_locks_are_not_waited_for() {
        let pmm = pmm(256 * 1024);
        let kernel = AddressSpace::new_kernel(&pmm).unwrap();
        let held = kernel.tables_locked_for_test();
        let report = diagnose_page_fault(&kernel, VirtualAddress::new(0x1000), 0);
        assert!(!report.complete);
        drop(held);
        assert!(diagnose_page_fault(&kernel, VirtualAddress::new(0x1000), 0).complete);
    }
}
