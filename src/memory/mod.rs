//! # Memory Management
//!
//! ## Submodules
//!
//! - `frame`: page bitmap over physical memory above the reserved boundary
//! - `heap`: bump allocator backing every kernel allocation
//! - `mapping`: physical-to-virtual translation and bring-up mappings
//!
//! ## Initialization Order
//!
//! 1. [`init_physical_memory`] builds the page bitmap from the memory map
//! 2. [`reserve_heap_region`] takes a contiguous run of pages for the heap
//! 3. [`init_heap`] hands that run to the global allocator
//!
//! The page manager is a single instance behind a spin lock; the heap is the
//! registered global allocator.

pub mod frame;
pub mod heap;
pub mod mapping;

use core::ptr::NonNull;

use x86_64::{PhysAddr, VirtAddr};

use crate::boot_info::{BootInformation, MemoryRegion};
use crate::config::PAGE_SIZE;
use crate::sync::Locked;

pub use frame::{FrameError, PhysicalMemoryManager};
pub use heap::{BumpHeap, HeapError};

static PHYSICAL_MEMORY: Locked<Option<PhysicalMemoryManager<'static>>> = Locked::new(None);

#[cfg_attr(not(test), global_allocator)]
pub static KERNEL_HEAP: BumpHeap = BumpHeap::new();

/// Build the page bitmap. `None` selects the fallback pool.
pub fn init_physical_memory<I>(regions: Option<I>) -> Result<(), &'static str>
where
    I: IntoIterator<Item = MemoryRegion>,
{
    let bitmap = frame::bitmap_storage().ok_or("physical memory already initialized")?;
    let mut manager = PhysicalMemoryManager::new(bitmap);
    manager.init(regions);
    *PHYSICAL_MEMORY.lock() = Some(manager);
    Ok(())
}

/// Build the page bitmap from a raw firmware record.
///
/// # Safety
/// The record's memory map pointer must be valid for its declared size.
pub unsafe fn init_from_boot_information(info: &BootInformation) -> Result<(), &'static str> {
    init_physical_memory(info.memory_map().map(|map| map.regions()))
}

/// Run `f` against the page manager, or `None` before it exists.
pub fn with_physical_memory<R>(
    f: impl FnOnce(&mut PhysicalMemoryManager<'static>) -> R,
) -> Option<R> {
    PHYSICAL_MEMORY.lock().as_mut().map(f)
}

pub fn allocate_page() -> Result<PhysAddr, FrameError> {
    with_physical_memory(|pmm| pmm.allocate_page()).unwrap_or(Err(FrameError::OutOfMemory))
}

pub fn free_page(address: PhysAddr) {
    with_physical_memory(|pmm| pmm.free_page(address));
}

pub fn total_memory() -> u64 {
    with_physical_memory(|pmm| pmm.total_memory()).unwrap_or(0)
}

pub fn free_memory() -> u64 {
    with_physical_memory(|pmm| pmm.free_memory()).unwrap_or(0)
}

/// Take `pages` contiguous pages and return where they appear in the offset
/// window, with their length in bytes.
pub fn reserve_heap_region(pages: usize) -> Result<(VirtAddr, usize), &'static str> {
    let start = with_physical_memory(|pmm| pmm.allocate_contiguous(pages))
        .ok_or("physical memory not initialized")?
        .map_err(|_| "no contiguous run large enough for the heap")?;
    Ok((mapping::phys_to_virt(start), pages * PAGE_SIZE as usize))
}

/// # Safety
/// The region must be mapped, writable and unused by anything else.
pub unsafe fn init_heap(start: VirtAddr, size: usize) -> Result<(), HeapError> {
    KERNEL_HEAP.init(start.as_u64() as usize, size)
}

pub fn allocate(size: usize) -> Result<NonNull<u8>, HeapError> {
    KERNEL_HEAP.allocate(size)
}

pub fn memory_stats() {
    log::info!(
        "memory: {} KiB free of {} KiB, heap {} of {} bytes used",
        free_memory() / 1024,
        total_memory() / 1024,
        KERNEL_HEAP.used(),
        KERNEL_HEAP.capacity()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_info::tests::{boot_record, firmware_map_bytes};
    use crate::config::RESERVED_LOW_MEMORY;

    // The page manager is a singleton; everything about it is checked here.
    #[test]
    fn boot_record_builds_the_page_manager_once() {
        let bytes = firmware_map_bytes(
            &[
                (7, RESERVED_LOW_MEMORY, 64),
                (2, RESERVED_LOW_MEMORY + 64 * PAGE_SIZE, 16),
                (4, RESERVED_LOW_MEMORY + 80 * PAGE_SIZE, 16),
            ],
            48,
        );
        let info = boot_record(&bytes, 48);
        assert_eq!(unsafe { init_from_boot_information(&info) }, Ok(()));
        assert_eq!(total_memory(), 80 * PAGE_SIZE);

        let page = allocate_page().unwrap();
        assert_eq!(page.as_u64(), RESERVED_LOW_MEMORY);
        assert_eq!(free_memory(), 79 * PAGE_SIZE);
        free_page(page);
        assert_eq!(free_memory(), 80 * PAGE_SIZE);

        assert_eq!(
            init_physical_memory(None::<[MemoryRegion; 0]>),
            Err("physical memory already initialized")
        );
        assert_eq!(total_memory(), 80 * PAGE_SIZE);
    }
}
