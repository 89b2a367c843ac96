//! Physical-to-virtual translation and the few extra mappings bring-up needs.
//!
//! The loader maps all of physical memory at one offset; everything the kernel
//! touches by physical address goes through [`phys_to_virt`]. Two things fall
//! outside that window: the startup routine, which must run at its physical
//! address, and controller registers above the end of RAM.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::structures::paging::mapper::{MapToError, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_physical_memory_offset(offset: u64) {
    PHYSICAL_MEMORY_OFFSET.store(offset, Ordering::Release);
}

pub fn physical_memory_offset() -> u64 {
    PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire)
}

pub fn phys_to_virt(address: PhysAddr) -> VirtAddr {
    VirtAddr::new(address.as_u64() + physical_memory_offset())
}

pub unsafe fn active_page_table() -> OffsetPageTable<'static> {
    let (level_4_frame, _) = x86_64::registers::control::Cr3::read();
    let table: *mut PageTable = phys_to_virt(level_4_frame.start_address()).as_mut_ptr();
    OffsetPageTable::new(&mut *table, VirtAddr::new(physical_memory_offset()))
}

fn map_one(
    mapper: &mut OffsetPageTable<'static>,
    page: Page<Size4KiB>,
    frame: PhysFrame<Size4KiB>,
    flags: PageTableFlags,
    frames: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), &'static str> {
    match mapper.translate(page.start_address()) {
        TranslateResult::Mapped { frame: mapped, .. } => {
            if mapped.start_address() == frame.start_address() {
                Ok(())
            } else {
                Err("virtual page already mapped elsewhere")
            }
        }
        TranslateResult::NotMapped => {
            // Safety: the page was unmapped and the frame is device or
            // bootstrap memory reserved for this purpose.
            let flush = unsafe { mapper.map_to(page, frame, flags, frames) }.map_err(|e| match e {
                MapToError::FrameAllocationFailed => "out of frames for page tables",
                MapToError::ParentEntryHugePage => "address covered by a huge page",
                MapToError::PageAlreadyMapped(_) => "virtual page already mapped",
            })?;
            flush.flush();
            Ok(())
        }
        TranslateResult::InvalidFrameAddress(_) => Err("invalid frame in page table"),
    }
}

/// Map `frame` at the virtual address equal to its physical address.
pub unsafe fn identity_map(
    frame: PhysFrame<Size4KiB>,
    frames: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), &'static str> {
    let mut mapper = active_page_table();
    let page = Page::containing_address(VirtAddr::new(frame.start_address().as_u64()));
    map_one(
        &mut mapper,
        page,
        frame,
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        frames,
    )
}

/// Make a device register page reachable through the offset window, uncached.
pub unsafe fn map_mmio(
    address: PhysAddr,
    frames: &mut impl FrameAllocator<Size4KiB>,
) -> Result<VirtAddr, &'static str> {
    let mut mapper = active_page_table();
    let frame = PhysFrame::containing_address(address);
    let page = Page::containing_address(phys_to_virt(frame.start_address()));
    map_one(
        &mut mapper,
        page,
        frame,
        PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH
            | PageTableFlags::NO_EXECUTE,
        frames,
    )?;
    Ok(phys_to_virt(address))
}
