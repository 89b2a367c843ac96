//! # Segment Descriptor Table
//!
//! Five flat segments; in long mode only the access rights and the long-mode
//! bit still matter.
//!
//! | Index | Selector | Segment     | Access | Flags |
//! |-------|----------|-------------|--------|-------|
//! | 0     | 0x00     | null        | 0x00   | 0x0   |
//! | 1     | 0x08     | kernel code | 0x9A   | 0xA   |
//! | 2     | 0x10     | kernel data | 0x92   | 0xC   |
//! | 3     | 0x1B     | user code   | 0xFA   | 0xA   |
//! | 4     | 0x23     | user data   | 0xF2   | 0xC   |
//!
//! Every core loads the same table. The raw descriptors are computed at
//! compile time; the table is assembled once on first use and never written
//! afterwards.

use bitflags::bitflags;
use spin::Lazy;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::PrivilegeLevel;

pub const GDT_ENTRIES: usize = 5;

pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);

bitflags! {
    /// Access byte of a code or data descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const ACCESSED = 1 << 0;
        const READ_WRITE = 1 << 1;
        const DIRECTION_CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const CODE_OR_DATA = 1 << 4;
        const RING_3 = 3 << 5;
        const PRESENT = 1 << 7;
    }
}

bitflags! {
    /// Upper nibble of the granularity byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Granularity: u8 {
        const LONG_MODE = 1 << 5;
        const SIZE_32 = 1 << 6;
        const PAGES = 1 << 7;
    }
}

const KERNEL_CODE: Access = Access::PRESENT
    .union(Access::CODE_OR_DATA)
    .union(Access::EXECUTABLE)
    .union(Access::READ_WRITE);
const KERNEL_DATA: Access = Access::PRESENT
    .union(Access::CODE_OR_DATA)
    .union(Access::READ_WRITE);
const CODE_64: Granularity = Granularity::PAGES.union(Granularity::LONG_MODE);
const DATA_32: Granularity = Granularity::PAGES.union(Granularity::SIZE_32);

/// Pack one 8-byte descriptor.
pub const fn encode(base: u32, limit: u32, access: Access, granularity: Granularity) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | (base & 0xFF_FFFF) << 16
        | (access.bits() as u64) << 40
        | ((limit >> 16) & 0xF) << 48
        | ((granularity.bits() & 0xF0) as u64) << 48
        | ((base >> 24) & 0xFF) << 56
}

/// Raw descriptors after the implicit null entry, in selector order.
pub const FLAT_SEGMENTS: [u64; GDT_ENTRIES - 1] = [
    encode(0, 0xFFFF_FFFF, KERNEL_CODE, CODE_64),
    encode(0, 0xFFFF_FFFF, KERNEL_DATA, DATA_32),
    encode(0, 0xFFFF_FFFF, KERNEL_CODE.union(Access::RING_3), CODE_64),
    encode(0, 0xFFFF_FFFF, KERNEL_DATA.union(Access::RING_3), DATA_32),
];

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
}

static GDT: Lazy<(GlobalDescriptorTable<GDT_ENTRIES>, Selectors)> = Lazy::new(|| {
    let mut gdt = GlobalDescriptorTable::empty();
    let [kernel_code, kernel_data, user_code, user_data] =
        FLAT_SEGMENTS.map(|raw| gdt.append(Descriptor::UserSegment(raw)));
    (
        gdt,
        Selectors {
            kernel_code,
            kernel_data,
            user_code,
            user_data,
        },
    )
});

pub fn table() -> &'static GlobalDescriptorTable<GDT_ENTRIES> {
    &GDT.0
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Load the table on the calling core and reload every segment register.
pub fn init() {
    let (ref gdt, ref selectors) = *GDT;
    gdt.load();
    // Safety: the table is loaded and its code/data selectors are valid.
    unsafe {
        CS::set_reg(selectors.kernel_code);
        DS::set_reg(selectors.kernel_data);
        ES::set_reg(selectors.kernel_data);
        SS::set_reg(selectors.kernel_data);
        FS::set_reg(selectors.kernel_data);
        GS::set_reg(selectors.kernel_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_descriptor_is_zero() {
        assert_eq!(table().entries()[0].raw(), 0);
    }

    #[test]
    fn flat_segments_encode_as_expected() {
        let entries = table().entries();
        assert_eq!(entries.len(), GDT_ENTRIES);
        assert_eq!(entries[1].raw(), 0x00AF_9A00_0000_FFFF);
        assert_eq!(entries[2].raw(), 0x00CF_9200_0000_FFFF);
        assert_eq!(entries[3].raw(), 0x00AF_FA00_0000_FFFF);
        assert_eq!(entries[4].raw(), 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn base_is_split_across_three_fields() {
        let raw = encode(0x1234_5678, 0, Access::PRESENT, Granularity::empty());
        assert_eq!(raw & 0xFFFF, 0);
        assert_eq!((raw >> 16) & 0xFF_FFFF, 0x34_5678);
        assert_eq!(raw >> 56, 0x12);
        assert_eq!((raw >> 40) & 0xFF, 0x80);
    }

    #[test]
    fn selectors_match_table_slots() {
        assert_eq!(KERNEL_CODE_SELECTOR.0, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR.0, 0x10);
        assert_eq!(USER_CODE_SELECTOR.0, 0x1B);
        assert_eq!(USER_DATA_SELECTOR.0, 0x23);

        let appended = selectors();
        assert_eq!(appended.kernel_code, KERNEL_CODE_SELECTOR);
        assert_eq!(appended.kernel_data, KERNEL_DATA_SELECTOR);
        assert_eq!(appended.user_code, USER_CODE_SELECTOR);
        assert_eq!(appended.user_data, USER_DATA_SELECTOR);
    }

    #[test]
    fn table_is_forty_bytes() {
        assert_eq!(core::mem::size_of_val(table().entries()), 40);
    }
}
