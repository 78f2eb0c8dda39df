/// Failures of the kernel heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// No block fits and the heap cannot grow far enough.
    #[error("kernel heap exhausted")]
    OutOfMemory,
    #[error("kernel heap is not set up")]
    NotInitialized,
    #[error("kernel heap was already set up")]
    AlreadyInitialized,
    /// The pointer is not the payload of a used block.
    #[error("pointer does not belong to a live heap block")]
    InvalidPointer,
    /// Alignment not a power of two, a size too large to represent, or a
    /// heap window that cannot be mapped.
    #[error("invalid layout")]
    InvalidLayout,
}
