//! # Physical Memory Manager
//!
//! Tracks ownership of 4 KiB physical pages above the reserved low-memory
//! boundary with one bit per page: 1 = allocated or reserved, 0 = free.
//! A second bitmap of the same size marks which pages the memory map called
//! usable, so a reserved hole is never mistaken for an allocation.
//!
//! ```text
//! RESERVED_LOW_MEMORY                         base + span_pages * 4 KiB
//! |<------------------ managed window --------------->|
//! [ free | free | hole (reserved) | free | ... ]
//! ```
//!
//! Allocation is first fit from the lowest address. There is no locality
//! hinting: pages are only requested during bring-up.
//!
//! All conversions between addresses and bit indices go through
//! [`PhysicalMemoryManager::page_index`] and
//! [`PhysicalMemoryManager::page_address`].

use core::fmt;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::boot_info::MemoryRegion;
use crate::config::{FALLBACK_POOL_SIZE, PAGE_SIZE, PHYSICAL_MEMORY_CEILING, RESERVED_LOW_MEMORY};

const BITS_PER_WORD: usize = u64::BITS as usize;
const FULL: u64 = u64::MAX;

/// Words needed to describe every page up to the ceiling (2 MiB per bitmap).
pub const BITMAP_WORDS: usize = (PHYSICAL_MEMORY_CEILING / PAGE_SIZE) as usize / BITS_PER_WORD;

/// Allocation bitmap followed by the usable-page bitmap.
static mut PAGE_BITMAP: [u64; 2 * BITMAP_WORDS] = [0; 2 * BITMAP_WORDS];
static BITMAP_TAKEN: AtomicBool = AtomicBool::new(false);

/// Hands out the kernel's bitmap storage exactly once.
pub fn bitmap_storage() -> Option<&'static mut [u64]> {
    if BITMAP_TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // Safety: the swap above guarantees a single mutable borrow.
    Some(unsafe { &mut *addr_of_mut!(PAGE_BITMAP) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    OutOfMemory,
    EmptyRequest,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::OutOfMemory => write!(f, "out of physical memory"),
            FrameError::EmptyRequest => write!(f, "zero pages requested"),
        }
    }
}

/// Half-open range of page indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageRange {
    first: usize,
    end: usize,
}

pub struct PhysicalMemoryManager<'a> {
    bitmap: &'a mut [u64],
    usable: &'a mut [u64],
    base: PhysAddr,
    /// Bits below this index are scanned by the allocator.
    span_pages: usize,
    total_pages: usize,
    used_pages: usize,
    usable_regions: usize,
}

impl<'a> PhysicalMemoryManager<'a> {
    /// A manager over `storage` with everything reserved until `init` runs.
    /// The first half of `storage` holds allocation bits, the second half
    /// the usable-page bits.
    pub fn new(storage: &'a mut [u64]) -> Self {
        let half = storage.len() / 2;
        let (bitmap, usable) = storage.split_at_mut(half);
        bitmap.fill(FULL);
        usable.fill(0);
        Self {
            bitmap,
            usable: &mut usable[..half],
            base: PhysAddr::new(RESERVED_LOW_MEMORY),
            span_pages: 0,
            total_pages: 0,
            used_pages: 0,
            usable_regions: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.bitmap.len() * BITS_PER_WORD
    }

    /// Rebuild the bitmap from a memory map. Without a map, or when the map has
    /// no usable page above the boundary, a fixed pool directly above the
    /// boundary is assumed free.
    pub fn init<I>(&mut self, regions: Option<I>)
    where
        I: IntoIterator<Item = MemoryRegion>,
    {
        self.bitmap.fill(FULL);
        self.usable.fill(0);
        self.span_pages = 0;
        self.total_pages = 0;
        self.used_pages = 0;
        self.usable_regions = 0;

        for region in regions.into_iter().flatten() {
            if !region.kind.is_usable() {
                continue;
            }
            if let Some(range) = self.window(region.start.as_u64(), region.end()) {
                self.release_range(range);
            }
        }

        if self.total_pages == 0 {
            let end = self.base.as_u64() + FALLBACK_POOL_SIZE;
            log::warn!(
                "pmm: no usable memory map, assuming {} KiB at {:#x}",
                FALLBACK_POOL_SIZE / 1024,
                self.base.as_u64()
            );
            if let Some(range) = self.window(self.base.as_u64(), end) {
                self.release_range(range);
            }
        }

        log::info!(
            "pmm: {} pages usable, {} pages spanned, {} usable regions",
            self.total_pages,
            self.span_pages,
            self.usable_regions
        );
    }

    /// Clip `[start, end)` to the managed window, rounding inwards to whole pages.
    fn window(&self, start: u64, end: u64) -> Option<PageRange> {
        let low = start.max(self.base.as_u64());
        let low = low.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
        let ceiling = self.base.as_u64() + self.capacity() as u64 * PAGE_SIZE;
        let high = end.min(ceiling) & !(PAGE_SIZE - 1);
        if low >= high {
            return None;
        }
        let first = self.page_index(PhysAddr::new(low))?;
        let end = first + ((high - low) / PAGE_SIZE) as usize;
        Some(PageRange { first, end })
    }

    fn release_range(&mut self, range: PageRange) {
        for index in range.first..range.end {
            if !self.is_usable(index) {
                self.usable[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
                self.clear(index);
                self.total_pages += 1;
            }
        }
        self.usable_regions += 1;
        self.span_pages = self.span_pages.max(range.end);
    }

    fn is_usable(&self, index: usize) -> bool {
        self.usable[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Bit index of the page starting at `address`, if it is managed.
    pub fn page_index(&self, address: PhysAddr) -> Option<usize> {
        let offset = address.as_u64().checked_sub(self.base.as_u64())?;
        if offset % PAGE_SIZE != 0 {
            return None;
        }
        let index = (offset / PAGE_SIZE) as usize;
        (index < self.capacity()).then_some(index)
    }

    pub fn page_address(&self, index: usize) -> PhysAddr {
        self.base + index as u64 * PAGE_SIZE
    }

    fn test(&self, index: usize) -> bool {
        self.bitmap[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bitmap[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
    }

    fn clear(&mut self, index: usize) {
        self.bitmap[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
    }

    /// Lowest free page, marked allocated.
    pub fn allocate_page(&mut self) -> Result<PhysAddr, FrameError> {
        let words = self.span_pages.div_ceil(BITS_PER_WORD);
        for word_index in 0..words {
            let word = self.bitmap[word_index];
            if word == FULL {
                continue;
            }
            let index = word_index * BITS_PER_WORD + (!word).trailing_zeros() as usize;
            if index >= self.span_pages {
                break;
            }
            self.set(index);
            self.used_pages += 1;
            return Ok(self.page_address(index));
        }
        Err(FrameError::OutOfMemory)
    }

    /// Lowest run of `count` free pages, all marked allocated.
    pub fn allocate_contiguous(&mut self, count: usize) -> Result<PhysAddr, FrameError> {
        if count == 0 {
            return Err(FrameError::EmptyRequest);
        }
        let mut run_start = 0;
        let mut run_length = 0;
        for index in 0..self.span_pages {
            if self.test(index) {
                run_length = 0;
                continue;
            }
            if run_length == 0 {
                run_start = index;
            }
            run_length += 1;
            if run_length == count {
                for page in run_start..run_start + count {
                    self.set(page);
                }
                self.used_pages += count;
                return Ok(self.page_address(run_start));
            }
        }
        Err(FrameError::OutOfMemory)
    }

    /// Return a page. Addresses outside the managed window, reserved holes and
    /// pages that are already free are ignored.
    pub fn free_page(&mut self, address: PhysAddr) {
        let Some(index) = self.page_index(address) else {
            return;
        };
        if index >= self.span_pages || !self.is_usable(index) || !self.test(index) {
            return;
        }
        self.clear(index);
        self.used_pages -= 1;
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub fn total_memory(&self) -> u64 {
        self.total_pages as u64 * PAGE_SIZE
    }

    pub fn free_memory(&self) -> u64 {
        (self.total_pages - self.used_pages) as u64 * PAGE_SIZE
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysicalMemoryManager<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate_page().ok().map(PhysFrame::containing_address)
    }
}
