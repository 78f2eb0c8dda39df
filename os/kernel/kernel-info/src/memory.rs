//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Base of the direct physical-memory window.
/// Physical address `pa` is reachable at [`HHDM_BASE`] + `pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Size of the direct window established at boot.
///
/// Kept small so building it does not exhaust the page allocator before the
/// heap exists; frames above it are not handed out.
pub const DIRECT_MAP_BYTES: u64 = 64 * 1024 * 1024;

/// Start of the kernel heap's virtual range.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Bytes mapped for the heap during setup.
pub const KERNEL_HEAP_INITIAL: u64 = 16 * 1024 * 1024;

/// Hard ceiling for heap growth.
pub const KERNEL_HEAP_MAX: u64 = 1024 * 1024 * 1024;

/// Fixed window for device memory (frame buffers, memory-mapped registers).
pub const MMIO_BASE: u64 = 0xffff_ffff_f000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Bytes reserved for the kernel image mapping.
pub const KERNEL_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

/// Legacy VGA graphics window.
pub const VGA_FRAMEBUFFER_PHYS: u64 = 0x000a_0000;

/// Length of the VGA window (`0xA0000..0xC0000`), text buffer included.
pub const VGA_FRAMEBUFFER_BYTES: u64 = 0x2_0000;

/// Colour text-mode buffer inside the VGA window.
pub const VGA_TEXT_PHYS: u64 = 0x000b_8000;

/// Number of PML4 slots per half.
pub const PML4_HALF: usize = 256;

const _: () = {
    assert!(DIRECT_MAP_BYTES.is_multiple_of(4096));
    assert!(KERNEL_HEAP_INITIAL.is_multiple_of(4096));
    assert!(KERNEL_HEAP_INITIAL <= KERNEL_HEAP_MAX);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(HHDM_BASE + DIRECT_MAP_BYTES <= KERNEL_HEAP_BASE);
    assert!(KERNEL_HEAP_BASE + KERNEL_HEAP_MAX <= KERNEL_BASE);
    assert!(KERNEL_BASE + KERNEL_IMAGE_BYTES <= MMIO_BASE);
    assert!(VGA_TEXT_PHYS >= VGA_FRAMEBUFFER_PHYS);
    assert!(VGA_TEXT_PHYS < VGA_FRAMEBUFFER_PHYS + VGA_FRAMEBUFFER_BYTES);
};
