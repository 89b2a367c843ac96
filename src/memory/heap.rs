//! # Bump Heap
//!
//! A cursor that only moves forward through `[start, end)`. Every block is
//! 16-byte aligned and its size rounded to a multiple of 16. Nothing is ever
//! reclaimed: the kernel allocates during bring-up and keeps what it got.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const HEAP_ALIGN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    NotInitialized,
    AlreadyInitialized,
    InvalidRegion,
    Exhausted,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::NotInitialized => write!(f, "heap used before init"),
            HeapError::AlreadyInitialized => write!(f, "heap already initialized"),
            HeapError::InvalidRegion => write!(f, "invalid heap region"),
            HeapError::Exhausted => write!(f, "heap exhausted"),
        }
    }
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub struct BumpHeap {
    start: AtomicUsize,
    end: AtomicUsize,
    cursor: AtomicUsize,
    initialized: AtomicBool,
}

impl BumpHeap {
    pub const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Hand the heap its region. The start is rounded up to 16 bytes.
    ///
    /// # Safety
    /// `[start, start + size)` must be writable memory owned by nobody else for
    /// the rest of the kernel's life.
    pub unsafe fn init(&self, start: usize, size: usize) -> Result<(), HeapError> {
        if start == 0 || size == 0 {
            return Err(HeapError::InvalidRegion);
        }
        let end = start.checked_add(size).ok_or(HeapError::InvalidRegion)?;
        let aligned = align_up(start, HEAP_ALIGN);
        if aligned >= end {
            return Err(HeapError::InvalidRegion);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(HeapError::AlreadyInitialized);
        }

        self.start.store(aligned, Ordering::Release);
        self.end.store(end, Ordering::Release);
        self.cursor.store(aligned, Ordering::Release);
        log::info!("heap: {:#x}..{:#x} ({} KiB)", aligned, end, (end - aligned) / 1024);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Advance the cursor past an `align`-aligned block of `size` bytes.
    fn bump(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !self.is_initialized() {
            return Err(HeapError::NotInitialized);
        }
        let end = self.end.load(Ordering::Acquire);
        let size = size
            .checked_add(HEAP_ALIGN - 1)
            .ok_or(HeapError::Exhausted)?
            & !(HEAP_ALIGN - 1);

        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let block = align_up(current, align.max(HEAP_ALIGN));
            let next = block.checked_add(size).ok_or(HeapError::Exhausted)?;
            // a block must start inside the region, even an empty one
            if next > end || block >= end {
                return Err(HeapError::Exhausted);
            }
            if self
                .cursor
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return NonNull::new(block as *mut u8).ok_or(HeapError::InvalidRegion);
            }
        }
    }

    /// A 16-byte aligned block of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.bump(size, HEAP_ALIGN)
    }

    /// `count * size` bytes, zero-filled.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let bytes = count.checked_mul(size).ok_or(HeapError::Exhausted)?;
        let block = self.allocate(bytes)?;
        // Safety: the block was just carved out of the heap and is `bytes` long.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, bytes) };
        Ok(block)
    }

    /// Intentionally does nothing.
    pub fn deallocate(&self, _block: *mut u8) {}

    pub fn used(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.cursor
            .load(Ordering::Acquire)
            .saturating_sub(self.start.load(Ordering::Acquire))
    }

    pub fn remaining(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.end
            .load(Ordering::Acquire)
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    pub fn capacity(&self) -> usize {
        self.used() + self.remaining()
    }
}

impl Default for BumpHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for BumpHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.bump(layout.size(), layout.align()) {
            Ok(block) => block.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let block = self.alloc(layout);
        if !block.is_null() {
            ptr::write_bytes(block, 0, layout.size());
        }
        block
    }

    unsafe fn dealloc(&self, block: *mut u8, _layout: Layout) {
        self.deallocate(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Arena([u8; 1024]);

    fn heap_over(arena: &mut Arena) -> BumpHeap {
        let heap = BumpHeap::new();
        unsafe { heap.init(arena.0.as_mut_ptr() as usize, arena.0.len()).unwrap() };
        heap
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let mut arena = Arena([0xAA; 1024]);
        let heap = heap_over(&mut arena);

        let a = heap.allocate(3).unwrap().as_ptr() as usize;
        let b = heap.allocate(40).unwrap().as_ptr() as usize;
        let c = heap.allocate(1).unwrap().as_ptr() as usize;
        assert_eq!(a % HEAP_ALIGN, 0);
        assert_eq!(b % HEAP_ALIGN, 0);
        assert_eq!(c % HEAP_ALIGN, 0);
        assert!(a + 3 <= b);
        assert!(b + 40 <= c);
        assert_eq!(heap.used(), 16 + 48 + 16);
    }

    #[test]
    fn fails_once_rounded_requests_exceed_the_region() {
        let mut arena = Arena([0; 1024]);
        let heap = heap_over(&mut arena);

        for _ in 0..64 {
            heap.allocate(9).unwrap();
        }
        assert_eq!(heap.remaining(), 0);
        assert_eq!(heap.allocate(1), Err(HeapError::Exhausted));
        assert_eq!(heap.allocate(0), Err(HeapError::Exhausted));
        assert_eq!(heap.allocate(16), Err(HeapError::Exhausted));
    }

    #[test]
    fn empty_requests_point_inside_the_region() {
        let mut arena = Arena([0; 1024]);
        let start = arena.0.as_ptr() as usize;
        let heap = heap_over(&mut arena);

        heap.allocate(1000).unwrap();
        let empty = heap.allocate(0).unwrap().as_ptr() as usize;
        assert!(empty >= start && empty < start + 1024);
        assert_eq!(heap.used(), 1008);
    }

    #[test]
    fn oversized_request_leaves_cursor_alone() {
        let mut arena = Arena([0; 1024]);
        let heap = heap_over(&mut arena);

        heap.allocate(100).unwrap();
        let used = heap.used();
        assert!(heap.allocate(2000).is_err());
        assert!(heap.allocate(usize::MAX).is_err());
        assert_eq!(heap.used(), used);
    }

    #[test]
    fn zeroed_blocks_are_cleared() {
        let mut arena = Arena([0xFF; 1024]);
        let heap = heap_over(&mut arena);

        let block = heap.allocate_zeroed(10, 12).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(block.as_ptr(), 120) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(heap.allocate_zeroed(usize::MAX, 2), Err(HeapError::Exhausted));
    }

    #[test]
    fn deallocate_does_not_reclaim() {
        let mut arena = Arena([0; 1024]);
        let heap = heap_over(&mut arena);

        let block = heap.allocate(64).unwrap();
        heap.deallocate(block.as_ptr());
        assert_eq!(heap.used(), 64);
        assert_ne!(heap.allocate(64).unwrap(), block);
    }

    #[test]
    fn rejects_use_before_and_double_init() {
        let mut arena = Arena([0; 1024]);
        let heap = BumpHeap::new();
        assert_eq!(heap.allocate(8), Err(HeapError::NotInitialized));

        let start = arena.0.as_mut_ptr() as usize;
        unsafe {
            assert_eq!(heap.init(0, 64), Err(HeapError::InvalidRegion));
            heap.init(start, 1024).unwrap();
            assert_eq!(heap.init(start, 1024), Err(HeapError::AlreadyInitialized));
        }
    }

    #[test]
    fn global_alloc_honours_larger_alignment() {
        let mut arena = Arena([0; 1024]);
        let heap = heap_over(&mut arena);

        unsafe {
            heap.alloc(Layout::from_size_align(8, 8).unwrap());
            let wide = heap.alloc(Layout::from_size_align(32, 64).unwrap());
            assert!(!wide.is_null());
            assert_eq!(wide as usize % 64, 0);
        }
    }
}
