//! Kernel initialization phases

use x86_64::VirtAddr;

use crate::boot_info::MemoryRegion;
use crate::config::{HEAP_PAGES, TIMER_FREQUENCY_HZ};
use crate::core::interrupts::{self, apic, controller, gdt, pic, timer};
use crate::core::kernel::status::{
    register_component, report, update_component_status, InitStatus,
};
use crate::memory;
use crate::smp::{self, BringUpReport};
use crate::println;

const DESCRIPTOR_TABLES: &str = "Descriptor Tables";
const LEGACY_INTERRUPTS: &str = "Legacy Interrupts";
const PHYSICAL_MEMORY: &str = "Physical Memory";
const KERNEL_HEAP: &str = "Kernel Heap";
const MULTICORE: &str = "Multicore";
const LOCAL_INTERRUPTS: &str = "Local Interrupts";

/// Bring the boot core up in order: tables, legacy interrupts, page
/// manager, heap, other cores, then the local controller if one was found.
/// `memory_map` of `None` selects the fallback pool.
pub fn init_kernel<I>(memory_map: Option<I>) -> Result<BringUpReport, &'static str>
where
    I: IntoIterator<Item = MemoryRegion>,
{
    for name in [
        DESCRIPTOR_TABLES,
        LEGACY_INTERRUPTS,
        PHYSICAL_MEMORY,
        KERNEL_HEAP,
        MULTICORE,
        LOCAL_INTERRUPTS,
    ] {
        register_component(name);
    }
    println!("kestrel: bringing up the boot core");

    init_phase(DESCRIPTOR_TABLES, init_descriptor_tables)?;
    init_phase(LEGACY_INTERRUPTS, || {
        controller::enter_legacy_mode(TIMER_FREQUENCY_HZ)?;
        pic::unmask(1);
        Ok(())
    })?;
    init_phase(PHYSICAL_MEMORY, || memory::init_physical_memory(memory_map))?;
    init_phase(KERNEL_HEAP, init_heap)?;

    let mut cores = None;
    init_phase(MULTICORE, || {
        cores = Some(smp::init());
        Ok(())
    })?;
    let cores = cores.ok_or("multicore bring-up did not run")?;

    if cores.controller_active {
        init_phase(LOCAL_INTERRUPTS, init_local_interrupts)?;
    } else {
        log::info!("init: no local APIC, staying on the 8259 pair");
    }

    x86_64::instructions::interrupts::enable();
    report();
    memory::memory_stats();
    Ok(cores)
}

fn init_phase(
    name: &'static str,
    init_fn: impl FnOnce() -> Result<(), &'static str>,
) -> Result<(), &'static str> {
    update_component_status(name, InitStatus::InProgress);
    log::info!("init: {}", name);

    match init_fn() {
        Ok(()) => {
            update_component_status(name, InitStatus::Completed);
            Ok(())
        }
        Err(e) => {
            update_component_status(name, InitStatus::Failed(e));
            log::error!("init: {} failed: {}", name, e);
            Err(e)
        }
    }
}

fn init_descriptor_tables() -> Result<(), &'static str> {
    gdt::init();
    interrupts::init_idt()
}

fn init_heap() -> Result<(), &'static str> {
    let (start, size): (VirtAddr, usize) = memory::reserve_heap_region(HEAP_PAGES)?;
    // Safety: the region was just taken from the page manager and is mapped
    // through the physical memory window.
    unsafe { memory::init_heap(start, size) }.map_err(|_| "heap region rejected")
}

fn init_local_interrupts() -> Result<(), &'static str> {
    let mut local = apic::active().ok_or("local APIC not active")?;
    let mut delay = timer::PitDelay::new();
    controller::enter_controller_mode(&mut local, &mut delay, TIMER_FREQUENCY_HZ)
}
