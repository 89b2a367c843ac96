//! # Kernel Configuration
//!
//! Compile-time knobs for the bring-up core. Everything here is fixed at
//! build time; nothing is read from the command line or persisted.

use bootloader_api::config::{BootloaderConfig, Mapping};
use log::LevelFilter;

/// Size of one physical page.
pub const PAGE_SIZE: u64 = 4096;

/// Physical memory below this address is never handed out by the page
/// allocator. It holds firmware data, the loader and the bootstrap routine.
pub const RESERVED_LOW_MEMORY: u64 = 16 * 1024 * 1024;

/// Highest amount of memory (above the reserved boundary) the page bitmap
/// can describe.
pub const PHYSICAL_MEMORY_CEILING: u64 = 64 * 1024 * 1024 * 1024;

/// Pool assumed free when the loader supplies no usable memory map.
pub const FALLBACK_POOL_SIZE: u64 = 16 * 1024 * 1024;

/// Pages carved out of the page allocator for the kernel heap.
pub const HEAP_PAGES: usize = 1024;

/// Capacity of the per-core table.
pub const MAX_CORES: usize = 16;

/// Controller identifiers tried when starting secondary cores.
pub const CANDIDATE_APIC_IDS: u8 = 12;

/// Physical address the bootstrap routine is copied to. Must be page
/// aligned and below 1 MiB so the startup signal can encode it.
pub const TRAMPOLINE_ADDRESS: u64 = 0x8000;

/// Stack handed to each secondary core.
pub const SECONDARY_STACK_SIZE: usize = 16 * 1024;

/// Legacy timer rate.
pub const TIMER_FREQUENCY_HZ: u32 = 100;

/// Delay after the init signal.
pub const INIT_DELAY_US: u64 = 10_000;

/// Delay after each startup signal.
pub const STARTUP_DELAY_US: u64 = 200;

/// Interval between checks of a starting core's online flag.
pub const ONLINE_POLL_INTERVAL_US: u64 = 10_000;

/// Number of online checks before a core is abandoned (~1 s in total).
pub const ONLINE_POLL_ATTEMPTS: u32 = 100;

/// Default verbosity of the serial logger.
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Loader configuration: all of physical memory is mapped at a fixed offset
/// chosen by the loader. That offset is the only translation the kernel uses.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.kernel_stack_size = 128 * 1024;
    config
};
