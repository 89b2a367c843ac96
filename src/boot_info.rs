//! # Boot Information
//!
//! The record handed over by the loader stage and the memory map inside it.
//!
//! The firmware map is an array of descriptors whose stride is given by the
//! loader (`memory_map_descriptor_size`); firmware is allowed to append fields,
//! so the stride is never assumed to equal `size_of::<FirmwareDescriptor>()`.
//!
//! | Type | Firmware name        | Treated as    |
//! |------|----------------------|---------------|
//! | 3    | BootServicesCode     | reclaimable   |
//! | 4    | BootServicesData     | reclaimable   |
//! | 7    | ConventionalMemory   | free          |
//! | else | -                    | reserved      |

use core::mem::size_of;

use x86_64::PhysAddr;

use crate::config::PAGE_SIZE;

const FIRMWARE_BOOT_SERVICES_CODE: u32 = 3;
const FIRMWARE_BOOT_SERVICES_DATA: u32 = 4;
const FIRMWARE_CONVENTIONAL: u32 = 7;

/// Record produced by the loader. Framebuffer and ACPI fields are consumed by
/// collaborators outside the bring-up core.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootInformation {
    pub memory_map_size: u64,
    pub memory_map_descriptor_size: u64,
    pub memory_map: *const u8,

    pub framebuffer_base: u64,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_pitch: u32,
    pub framebuffer_bpp: u32,

    pub kernel_base: u64,
    pub kernel_size: u64,

    pub rsdp: *const u8,
}

impl BootInformation {
    /// The firmware memory map, or `None` when the loader supplied none.
    ///
    /// # Safety
    /// `memory_map` must point to `memory_map_size` readable bytes that stay
    /// valid for the returned lifetime.
    pub unsafe fn memory_map(&self) -> Option<FirmwareMemoryMap<'_>> {
        if self.memory_map.is_null() || self.memory_map_size == 0 {
            return None;
        }
        let bytes = core::slice::from_raw_parts(self.memory_map, self.memory_map_size as usize);
        FirmwareMemoryMap::new(bytes, self.memory_map_descriptor_size as usize)
    }
}

/// One firmware descriptor, as laid out by the firmware.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FirmwareDescriptor {
    pub region_type: u32,
    pub padding: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub page_count: u64,
    pub attributes: u64,
}

static_assertions::const_assert_eq!(size_of::<FirmwareDescriptor>(), 40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Free,
    Reclaimable,
    Reserved,
}

impl RegionKind {
    pub fn from_firmware_type(region_type: u32) -> Self {
        match region_type {
            FIRMWARE_CONVENTIONAL => RegionKind::Free,
            FIRMWARE_BOOT_SERVICES_CODE | FIRMWARE_BOOT_SERVICES_DATA => RegionKind::Reclaimable,
            _ => RegionKind::Reserved,
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, RegionKind::Free | RegionKind::Reclaimable)
    }
}

/// A physical range with a type, independent of who reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub start: PhysAddr,
    pub page_count: u64,
}

impl MemoryRegion {
    pub fn new(kind: RegionKind, start: u64, page_count: u64) -> Self {
        Self {
            kind,
            start: PhysAddr::new(start),
            page_count,
        }
    }

    /// Exclusive end address, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.start
            .as_u64()
            .saturating_add(self.page_count.saturating_mul(PAGE_SIZE))
    }
}

impl From<&bootloader_api::info::MemoryRegion> for MemoryRegion {
    fn from(region: &bootloader_api::info::MemoryRegion) -> Self {
        use bootloader_api::info::MemoryRegionKind;

        let kind = match region.kind {
            MemoryRegionKind::Usable => RegionKind::Free,
            _ => RegionKind::Reserved,
        };
        let page_count = region.end.saturating_sub(region.start) / PAGE_SIZE;
        MemoryRegion::new(kind, region.start, page_count)
    }
}

/// Walks a raw firmware map by descriptor stride.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareMemoryMap<'a> {
    bytes: &'a [u8],
    descriptor_size: usize,
}

impl<'a> FirmwareMemoryMap<'a> {
    /// `None` if the stride cannot hold a descriptor.
    pub fn new(bytes: &'a [u8], descriptor_size: usize) -> Option<Self> {
        if descriptor_size < size_of::<FirmwareDescriptor>() {
            return None;
        }
        Some(Self { bytes, descriptor_size })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.descriptor_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self) -> impl Iterator<Item = FirmwareDescriptor> + 'a {
        let bytes = self.bytes;
        bytes
            .chunks_exact(self.descriptor_size)
            .map(|chunk| unsafe {
                core::ptr::read_unaligned(chunk.as_ptr() as *const FirmwareDescriptor)
            })
    }

    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion> + 'a {
        self.descriptors().map(|descriptor| MemoryRegion {
            kind: RegionKind::from_firmware_type(descriptor.region_type),
            start: PhysAddr::new_truncate(descriptor.physical_start),
            page_count: descriptor.page_count,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serializes descriptors the way firmware does, with a padded stride.
    pub(crate) fn firmware_map_bytes(entries: &[(u32, u64, u64)], stride: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; entries.len() * stride];
        for (slot, &(region_type, start, pages)) in entries.iter().enumerate() {
            let descriptor = FirmwareDescriptor {
                region_type,
                physical_start: start,
                page_count: pages,
                ..FirmwareDescriptor::default()
            };
            let raw = unsafe {
                core::slice::from_raw_parts(
                    &descriptor as *const FirmwareDescriptor as *const u8,
                    size_of::<FirmwareDescriptor>(),
                )
            };
            bytes[slot * stride..slot * stride + raw.len()].copy_from_slice(raw);
        }
        bytes
    }

    #[test]
    fn walks_by_declared_stride() {
        let bytes = firmware_map_bytes(
            &[(7, 0x100_0000, 256), (0, 0x0, 16), (4, 0x200_0000, 8)],
            48,
        );
        let map = FirmwareMemoryMap::new(&bytes, 48).unwrap();
        assert_eq!(map.len(), 3);

        let regions: Vec<_> = map.regions().collect();
        assert_eq!(regions[0], MemoryRegion::new(RegionKind::Free, 0x100_0000, 256));
        assert_eq!(regions[1].kind, RegionKind::Reserved);
        assert_eq!(regions[2].kind, RegionKind::Reclaimable);
        assert_eq!(regions[2].end(), 0x200_0000 + 8 * PAGE_SIZE);
    }

    #[test]
    fn rejects_stride_smaller_than_descriptor() {
        let bytes = [0u8; 64];
        assert!(FirmwareMemoryMap::new(&bytes, 32).is_none());
    }

    /// A loader record whose memory map is `map`, walked with `stride`.
    pub(crate) fn boot_record(map: &[u8], stride: usize) -> BootInformation {
        BootInformation {
            memory_map_size: map.len() as u64,
            memory_map_descriptor_size: stride as u64,
            memory_map: if map.is_empty() { core::ptr::null() } else { map.as_ptr() },
            framebuffer_base: 0,
            framebuffer_width: 0,
            framebuffer_height: 0,
            framebuffer_pitch: 0,
            framebuffer_bpp: 0,
            kernel_base: 0,
            kernel_size: 0,
            rsdp: core::ptr::null(),
        }
    }

    #[test]
    fn missing_map_reads_as_none() {
        let info = boot_record(&[], 48);
        assert!(unsafe { info.memory_map() }.is_none());
    }

    #[test]
    fn record_map_uses_the_record_stride() {
        let bytes = firmware_map_bytes(&[(7, 0x100_0000, 32), (1, 0x200_0000, 4)], 48);
        let info = boot_record(&bytes, 48);
        let map = unsafe { info.memory_map() }.unwrap();

        assert_eq!(map.len(), 2);
        let regions: Vec<_> = map.regions().collect();
        assert_eq!(regions[0], MemoryRegion::new(RegionKind::Free, 0x100_0000, 32));
        assert_eq!(regions[1], MemoryRegion::new(RegionKind::Reserved, 0x200_0000, 4));
    }

    #[test]
    fn loader_code_and_acpi_stay_reserved() {
        assert_eq!(RegionKind::from_firmware_type(1), RegionKind::Reserved);
        assert_eq!(RegionKind::from_firmware_type(2), RegionKind::Reserved);
        assert_eq!(RegionKind::from_firmware_type(9), RegionKind::Reserved);
        assert!(RegionKind::from_firmware_type(3).is_usable());
    }
}
