use kernel_info::boot::MemoryMap;
use kernel_pmm::{HostRam, PhysicalMemoryManager, PmmConfig};

/// A set-up manager over `bytes` of simulated RAM starting at physical 0.
pub(crate) fn pmm(bytes: usize) -> PhysicalMemoryManager<HostRam> {
    let ram = HostRam::new(bytes);
    let regions = [ram.usable_region()];
    let pmm = PhysicalMemoryManager::new(ram, PmmConfig { max_physical: u64::MAX });
    unsafe { pmm.setup(&MemoryMap::new(&regions)) }.expect("seeding simulated RAM");
    pmm
}
