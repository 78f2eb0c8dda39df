use kernel_memory_addresses::VirtualAddress;

/// Failures of address-space and VMM operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    /// No frame for a page table, page or VMA node.
    #[error("out of memory")]
    OutOfMemory,
    /// The range collides with an existing VMA.
    #[error("range {start}..{end} overlaps an existing area")]
    Overlap { start: VirtualAddress, end: VirtualAddress },
    /// Empty, unaligned or non-canonical range, or one crossing the half boundary.
    #[error("invalid range {start}..{end}")]
    InvalidRange { start: VirtualAddress, end: VirtualAddress },
    /// No VMA starts at this address.
    #[error("no area starts at {0}")]
    NotFound(VirtualAddress),
    /// The physical memory manager has not been set up.
    #[error("physical memory manager is not set up")]
    NotInitialized,
}
